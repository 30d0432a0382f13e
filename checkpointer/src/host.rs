//! Seam to the subnet host node.
//!
//! The host node owns the subnet chain: it streams tipset transitions,
//! serves actor-state reads and accepts messages into its mempool. The
//! checkpointing core only ever talks to it through [`HostApi`]; the
//! concrete client is injected, so there is no back-pointer from the
//! core into the node.

use async_trait::async_trait;
use thiserror::Error;

/// Method selector on the validator-set actor that registers a newly
/// generated group public key.
pub const PUBLISH_KEY_METHOD: u64 = 4;

/// Host errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host rpc error: {0}")]
    Rpc(String),
    #[error("tipset not found")]
    TipsetNotFound,
    #[error("actor state unavailable: {0}")]
    ActorState(String),
    #[error("message submission failed: {0}")]
    Submit(String),
}

/// Opaque serialized tipset key; the checkpoint payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TipsetKey(pub Vec<u8>);

impl TipsetKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A subnet tipset as reported by the host subscription.
#[derive(Debug, Clone)]
pub struct Tipset {
    pub height: u64,
    pub key: TipsetKey,
}

/// One tipset transition delivered by the host.
#[derive(Debug, Clone)]
pub struct Transition {
    pub old: Tipset,
    pub new: Tipset,
}

/// Validator-set actor state at a tipset.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    /// Ordered participant identifiers.
    pub miners: Vec<String>,
    /// Group public key registered on the actor; empty until the first
    /// publication lands.
    pub public_key: Vec<u8>,
}

/// Read and submit interface against the subnet host node.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Tipset key of the subnet genesis block.
    async fn genesis_key(&self) -> Result<TipsetKey, HostError>;

    /// Validator-set actor state at the given tipset.
    async fn validator_set(&self, at: &TipsetKey) -> Result<ValidatorSet, HostError>;

    /// Whether the host's active-sync workers have reached `height`.
    async fn sync_reached(&self, height: u64) -> Result<bool, HostError>;

    /// Whether the host chain contains the given tipset.
    async fn has_tipset(&self, key: &TipsetKey) -> Result<bool, HostError>;

    /// Submit the method-4 message registering a new group public key.
    /// Only the configured leader calls this, once per completed DKG.
    async fn publish_group_key(&self, key: &[u8; 32]) -> Result<(), HostError>;
}

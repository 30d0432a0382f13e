//! Checkpointing core: anchors a subnet's chain state to Bitcoin.
//!
//! Every participating validator runs this crate. At a fixed epoch
//! cadence the node spends the previous checkpoint UTXO into a new one
//! locked to a checkpoint-tweaked taproot key, with an `OP_RETURN`
//! committing to the content-addressed roster of signers; the roster
//! blob in turn embeds the subnet tipset key being anchored. The result
//! is an unbroken, threshold-signed chain of checkpoint transactions on
//! Bitcoin.
//!
//! ## Module Organization
//!
//! - `config` / `logging` - environment configuration and tracing setup
//! - `taproot` - BIP-340/341 key tweaking, sighash, witness assembly
//! - `bitcoin_rpc` - Bitcoin Core JSON-RPC client and the `BitcoinApi` seam
//! - `roster` - canonical signer roster and its content-addressed blob
//! - `store` - roster blob store (HTTP object store, in-memory)
//! - `host` - seam to the subnet host node (tipsets, actor state, mpool)
//! - `watcher` - per-tipset diffing: roster changes and checkpoint cadence
//! - `coordinator` - the checkpoint state machine
//! - `bootstrap` - startup: share loading, seeding, tip-UTXO recovery
//!
//! The host node, the Bitcoin node, the pubsub transport and the blob
//! store backend are external collaborators, injected behind traits.

pub mod bitcoin_rpc;
pub mod bootstrap;
pub mod config;
pub mod coordinator;
pub mod host;
pub mod logging;
pub mod roster;
pub mod store;
pub mod taproot;
pub mod watcher;

pub use bitcoin_rpc::{BitcoinApi, PrevOut, RpcClient, RpcError, TxInfo, Utxo};
pub use bootstrap::{bootstrap, BootstrapError};
pub use config::{Config, ConfigError, Network};
pub use coordinator::{CheckpointCursor, CheckpointError, Coordinator, CoordinatorState};
pub use host::{HostApi, HostError, Tipset, TipsetKey, Transition, ValidatorSet};
pub use logging::{init_logging, LoggingError};
pub use roster::{Roster, RosterError};
pub use store::{HttpRosterStore, MemoryRosterStore, RosterStore, StoreError};
pub use taproot::{NetworkParams, TaprootError};
pub use watcher::{CheckpointDiff, Diff, EpochWatcher, RosterDiff, WatcherError};

/// Satoshi conversion helpers.
pub mod units {
    pub const SATS_PER_BTC: u64 = 100_000_000;

    /// Convert BTC to satoshis with proper rounding.
    pub fn btc_to_sats(btc: f64) -> u64 {
        (btc * SATS_PER_BTC as f64).round() as u64
    }

    pub fn sats_to_btc(sats: u64) -> f64 {
        sats as f64 / SATS_PER_BTC as f64
    }

    /// Format a satoshi amount the way Bitcoin JSON-RPC expects BTC
    /// amounts: eight decimal places.
    pub fn format_btc(sats: u64) -> String {
        format!("{:.8}", sats_to_btc(sats))
    }

}

//! Per-tipset diffing.
//!
//! The watcher consumes tipset transitions from the host and reduces
//! each one to a [`Diff`] for the coordinator: a validator-set change, a
//! due checkpoint, both, or a newly registered group key. It is a pure
//! producer - reads only, one diff per transition - and gates all work
//! until the node has caught up to the subnet tip.
//!
//! The watcher snapshots coordinator state (share presence) under the
//! coordinator mutex, then releases it before publishing the roster
//! blob, so no I/O runs under the lock.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::coordinator::CoordinatorState;
use crate::host::{HostApi, HostError, TipsetKey, Transition};
use crate::roster::Roster;
use crate::store::{RosterStore, StoreError};

/// Watcher errors.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validator-set change: the new ordered roster, and the actor's group
/// key when it changed in the same transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterDiff {
    pub members: Vec<String>,
    pub published_key: Option<[u8; 32]>,
}

/// A checkpoint due this epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDiff {
    /// Tipset key bytes being anchored (the old tipset at the boundary).
    pub payload: Vec<u8>,
    /// Content hash of the published roster blob. Present only when this
    /// node holds an active share; observers have nothing to publish.
    pub roster_hash: Option<[u8; 32]>,
    /// The validator set at the new tipset, for rotation commits.
    pub members: Vec<String>,
    /// The actor's group key when it changed in the same transition.
    pub published_key: Option<[u8; 32]>,
}

/// One consumed-once event per tipset transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    /// The validator set changed and this node is in the new set.
    NewRoster(RosterDiff),
    /// A checkpoint is due at this height.
    Checkpoint(CheckpointDiff),
    /// Both in the same transition; the DKG runs first.
    RosterAndCheckpoint(RosterDiff, CheckpointDiff),
    /// The validator-set actor registered a new group key.
    KeyPublished([u8; 32]),
}

/// Watches tipset transitions and derives diffs.
pub struct EpochWatcher {
    host: Arc<dyn HostApi>,
    store: Arc<dyn RosterStore>,
    state: Arc<Mutex<CoordinatorState>>,
    node_id: String,
    period: u64,
    synced: bool,
    /// Latest checkpointed tipset recovered from Bitcoin at bootstrap;
    /// checked against the local chain once the node syncs.
    latest_checkpoint: Option<TipsetKey>,
}

impl std::fmt::Debug for EpochWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochWatcher")
            .field("node_id", &self.node_id)
            .field("period", &self.period)
            .field("synced", &self.synced)
            .field("latest_checkpoint", &self.latest_checkpoint)
            .finish_non_exhaustive()
    }
}

impl EpochWatcher {
    pub fn new(
        host: Arc<dyn HostApi>,
        store: Arc<dyn RosterStore>,
        state: Arc<Mutex<CoordinatorState>>,
        node_id: &str,
        period: u64,
        start_synced: bool,
        latest_checkpoint: Option<TipsetKey>,
    ) -> Self {
        Self {
            host,
            store,
            state,
            node_id: node_id.to_string(),
            period,
            synced: start_synced,
            latest_checkpoint,
        }
    }

    /// Reduce one tipset transition to a diff, if anything changed.
    pub async fn observe(&mut self, transition: &Transition) -> Result<Option<Diff>, WatcherError> {
        if !self.synced {
            if !self.host.sync_reached(transition.new.height).await? {
                return Ok(None);
            }
            if let Some(key) = &self.latest_checkpoint {
                if self.host.has_tipset(key).await? {
                    tracing::info!("synced; latest Bitcoin checkpoint found on the subnet chain");
                } else {
                    tracing::warn!(
                        "synced, but the latest Bitcoin checkpoint is not on the local chain"
                    );
                }
            } else {
                tracing::info!("synced with the subnet tip");
            }
            self.synced = true;
        }

        let old_set = self.host.validator_set(&transition.old.key).await?;
        let new_set = self.host.validator_set(&transition.new.key).await?;

        tracing::debug!(height = transition.new.height, "tipset transition");

        let (has_share, has_new_share) = {
            let state = self.state.lock().await;
            (state.share.is_some(), state.new_share.is_some())
        };

        // A change of the ordered roster is a DKG trigger, but only
        // participants of the new set take part.
        let roster_changed = old_set.miners != new_set.miners
            && new_set.miners.iter().any(|m| m == &self.node_id);

        let published_key = changed_group_key(&old_set.public_key, &new_set.public_key);

        let checkpoint_due = transition.new.height % self.period == 0
            && !old_set.miners.is_empty()
            && (has_share || has_new_share);

        let checkpoint = if checkpoint_due {
            let payload = transition.old.key.as_bytes().to_vec();
            let roster_hash = if has_share {
                let roster = Roster::new(new_set.miners.iter().cloned());
                let blob = roster.serialize(&payload);
                let hash = Roster::content_hash(&blob);
                self.store.put(&hash, &blob).await?;
                tracing::info!(
                    height = transition.new.height,
                    hash = %hex::encode(hash),
                    "published roster blob"
                );
                Some(hash)
            } else {
                None
            };
            Some(CheckpointDiff {
                payload,
                roster_hash,
                members: new_set.miners.clone(),
                published_key: None,
            })
        } else {
            None
        };

        let roster = if roster_changed {
            Some(RosterDiff {
                members: new_set.miners,
                published_key: None,
            })
        } else {
            None
        };

        Ok(combine(roster, checkpoint, published_key))
    }
}

/// The actor's key changed and the new value is a plausible x-only key.
fn changed_group_key(old: &[u8], new: &[u8]) -> Option<[u8; 32]> {
    if old == new || new.len() != 32 {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(new);
    Some(key)
}

/// Fold the observed parts into a single diff. A published key rides on
/// the part that is applied first, or stands alone.
fn combine(
    roster: Option<RosterDiff>,
    checkpoint: Option<CheckpointDiff>,
    published_key: Option<[u8; 32]>,
) -> Option<Diff> {
    match (roster, checkpoint) {
        (Some(mut roster), Some(checkpoint)) => {
            roster.published_key = published_key;
            Some(Diff::RosterAndCheckpoint(roster, checkpoint))
        }
        (Some(mut roster), None) => {
            roster.published_key = published_key;
            Some(Diff::NewRoster(roster))
        }
        (None, Some(mut checkpoint)) => {
            checkpoint.published_key = published_key;
            Some(Diff::Checkpoint(checkpoint))
        }
        (None, None) => published_key.map(Diff::KeyPublished),
    }
}

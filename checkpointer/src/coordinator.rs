//! The checkpoint state machine.
//!
//! One coordinator per subnet consumes the watcher's diffs strictly in
//! delivery order: a roster change triggers a DKG, a cadence boundary
//! produces a checkpoint, and a broadcast success advances the cursor
//! and rotates the signer set. Checkpoints are never pipelined - each
//! spends the previous checkpoint's UTXO.
//!
//! All state lives behind one mutex. The lock is held only for short
//! reads and commits; DKG rounds, signing rounds and every Bitcoin RPC
//! run with the lock released.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use frost_engine::{keygen, sign_with_tweak, KeygenError, SessionHub, ShareError, SignError, TaprootShare};

use crate::bitcoin_rpc::{BitcoinApi, PrevOut, RpcError, Utxo};
use crate::config::Config;
use crate::host::{HostApi, HostError};
use crate::store::{RosterStore, StoreError};
use crate::taproot::{self, NetworkParams, TaprootError};
use crate::watcher::{CheckpointDiff, Diff};

/// Checkpoint errors. The coordinator catches these at the top of each
/// transition; none of them advance the cursor.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no taproot share, cannot sign")]
    NoShare,
    #[error("checkpoint diff carries no roster hash")]
    MissingRosterHash,
    #[error("previous checkpoint txid unknown and not recoverable by scan")]
    MissingPreviousTxid,
    #[error("no spendable checkpoint output on {txid}")]
    UtxoNotFound { txid: String },
    #[error("input of {value_sats} sat cannot cover fee of {fee_sats} sat")]
    FeeUnderflow { value_sats: u64, fee_sats: u64 },
    #[error(transparent)]
    Taproot(#[from] TaprootError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error(transparent)]
    Keygen(#[from] KeygenError),
    #[error(transparent)]
    Sign(#[from] SignError),
}

/// In-memory head of the anchor chain.
///
/// Either `previous_txid` is empty (bootstrap pending) or a UTXO with
/// scriptPubKey `OP_1 <key>` exists at it on the Bitcoin node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCursor {
    /// Txid of the current tip checkpoint, "" if unknown.
    pub previous_txid: String,
    /// Tweaked x-only key locking the tip UTXO.
    pub key: [u8; 32],
    /// TapLeaf commitment root the tip key was derived with; the FROST
    /// engine needs it to re-derive the tweak when spending the tip.
    pub commitment_root: [u8; 32],
}

impl CheckpointCursor {
    pub fn unknown() -> Self {
        Self {
            previous_txid: String::new(),
            key: [0u8; 32],
            commitment_root: [0u8; 32],
        }
    }
}

/// Mutable coordinator state, shared with the epoch watcher.
#[derive(Default)]
pub struct CoordinatorState {
    /// Active signing share, if this node is a signer.
    pub share: Option<TaprootShare>,
    /// Share from a completed but not yet rotated-in DKG.
    pub new_share: Option<TaprootShare>,
    /// Head of the anchor chain.
    pub cursor: CheckpointCursor,
    /// Roster bound to `share`.
    pub roster: Vec<String>,
    /// Roster bound to `new_share`.
    pub new_roster: Vec<String>,
    /// Group key to rotate to at the next checkpoint. Set by a local DKG
    /// result or by the validator-set actor's key publication.
    pub new_key: Option<[u8; 32]>,
}

impl Default for CheckpointCursor {
    fn default() -> Self {
        Self::unknown()
    }
}

impl CoordinatorState {
    pub fn new_key_ready(&self) -> bool {
        self.new_key.is_some()
    }
}

/// Ties the watcher, the FROST engine, the Bitcoin node and the roster
/// store into the per-subnet checkpoint loop.
pub struct Coordinator {
    node_id: String,
    leader: String,
    fee_sats: u64,
    net_params: NetworkParams,
    share_path: PathBuf,
    round_timeout: Duration,
    host: Arc<dyn HostApi>,
    bitcoin: Arc<dyn BitcoinApi>,
    store: Arc<dyn RosterStore>,
    hub: Arc<SessionHub>,
    state: Arc<Mutex<CoordinatorState>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", &self.node_id)
            .field("leader", &self.leader)
            .finish_non_exhaustive()
    }
}

/// Path of the staging file holding a DKG result that has not been
/// rotated in yet.
pub fn staged_share_path(share_path: &Path) -> PathBuf {
    sibling_with_suffix(share_path, "next")
}

/// Where a share is parked when this node leaves the signer set. The
/// material is kept for the operator but no longer loads at startup.
pub fn retired_share_path(share_path: &Path) -> PathBuf {
    sibling_with_suffix(share_path, "retired")
}

fn sibling_with_suffix(share_path: &Path, suffix: &str) -> PathBuf {
    let name = share_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "share.toml".to_string());
    share_path.with_file_name(format!("{name}.{suffix}"))
}

impl Coordinator {
    pub fn new(
        config: &Config,
        host: Arc<dyn HostApi>,
        bitcoin: Arc<dyn BitcoinApi>,
        store: Arc<dyn RosterStore>,
        hub: Arc<SessionHub>,
        state: CoordinatorState,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            leader: config.leader.clone(),
            fee_sats: config.fee_sats,
            net_params: config.network_params(),
            share_path: config.share_path.clone(),
            round_timeout: config.round_timeout,
            host,
            bitcoin,
            store,
            hub,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Shared state handle, for the epoch watcher.
    pub fn state(&self) -> Arc<Mutex<CoordinatorState>> {
        Arc::clone(&self.state)
    }

    /// Roster store handle, for recovery paths.
    pub fn store(&self) -> Arc<dyn RosterStore> {
        Arc::clone(&self.store)
    }

    /// Consume diffs until the channel closes or shutdown fires.
    ///
    /// Errors are caught here: the state machine is re-entrant on the
    /// next epoch boundary, so a failed transition is logged and the
    /// loop keeps going.
    pub async fn run(
        self: Arc<Self>,
        mut diffs: mpsc::Receiver<Diff>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(node = %self.node_id, "coordinator started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                diff = diffs.recv() => match diff {
                    Some(diff) => {
                        if let Err(e) = self.handle_diff(diff).await {
                            tracing::error!(
                                error = %e,
                                "transition failed; cursor unchanged, re-driving next epoch"
                            );
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::info!(node = %self.node_id, "coordinator stopped");
    }

    /// Apply one diff. At most one DKG and one signing round run at a
    /// time; a roster change and a due checkpoint in the same diff run
    /// sequentially, DKG first.
    pub async fn handle_diff(&self, diff: Diff) -> Result<(), CheckpointError> {
        match diff {
            Diff::KeyPublished(key) => {
                self.note_published_key(key).await;
                Ok(())
            }
            Diff::NewRoster(roster) => {
                if let Some(key) = roster.published_key {
                    self.note_published_key(key).await;
                }
                self.run_keygen(&roster.members).await
            }
            Diff::Checkpoint(checkpoint) => {
                if let Some(key) = checkpoint.published_key {
                    self.note_published_key(key).await;
                }
                self.checkpoint_or_promote(&checkpoint).await
            }
            Diff::RosterAndCheckpoint(roster, checkpoint) => {
                if let Some(key) = roster.published_key {
                    self.note_published_key(key).await;
                }
                // A DKG failure skips the checkpoint too; the next epoch
                // re-drives both.
                self.run_keygen(&roster.members).await?;
                self.checkpoint_or_promote(&checkpoint).await
            }
        }
    }

    /// Record a group key registered on the validator-set actor. This is
    /// how signers that did not take part in the DKG (a leaving
    /// participant) learn the key the next checkpoint must commit to.
    async fn note_published_key(&self, key: [u8; 32]) {
        let mut state = self.state.lock().await;
        let current = state
            .share
            .as_ref()
            .and_then(|share| share.x_only().ok());
        match current {
            Some(current) if current != key => {
                tracing::info!(key = %hex::encode(key), "validator-set actor published a new group key");
                state.new_key = Some(key);
            }
            Some(_) => {} // already rotated to this key
            None => {
                // An observer has no old key to rotate away from; it
                // joins through DKG promotion instead.
            }
        }
    }

    /// Run a DKG with the new validator set. On success the share is
    /// staged; it becomes active when the next checkpoint commits the
    /// rotation. On failure nothing changes.
    async fn run_keygen(&self, members: &[String]) -> Result<(), CheckpointError> {
        tracing::info!(?members, "validator set changed, generating new group key");

        let share = keygen(&self.hub, members, self.round_timeout).await?;
        let group_key = share.x_only()?;
        share.save(&staged_share_path(&self.share_path))?;

        {
            let mut state = self.state.lock().await;
            state.new_roster = share.participants();
            state.new_key = Some(group_key);
            state.new_share = Some(share);
        }

        // Exactly one participant registers the key on the actor.
        if self.node_id == self.leader {
            self.host.publish_group_key(&group_key).await?;
            tracing::info!(key = %hex::encode(group_key), "published new group key to validator-set actor");
        }

        Ok(())
    }

    async fn checkpoint_or_promote(&self, diff: &CheckpointDiff) -> Result<(), CheckpointError> {
        let (has_share, has_new_share) = {
            let state = self.state.lock().await;
            (state.share.is_some(), state.new_share.is_some())
        };

        if has_share {
            self.create_checkpoint(diff).await
        } else if has_new_share {
            self.promote_observer(diff).await
        } else {
            tracing::debug!("checkpoint due but no share material; observing only");
            Ok(())
        }
    }

    /// Produce one checkpoint: spend the tip UTXO into a new output
    /// locked to the tweaked effective key, committing to the roster
    /// blob, signed by the roster bound to the active share.
    async fn create_checkpoint(&self, diff: &CheckpointDiff) -> Result<(), CheckpointError> {
        let (share, cursor, roster, new_key) = {
            let state = self.state.lock().await;
            (
                state.share.clone().ok_or(CheckpointError::NoShare)?,
                state.cursor.clone(),
                state.roster.clone(),
                state.new_key,
            )
        };
        let roster_hash = diff.roster_hash.ok_or(CheckpointError::MissingRosterHash)?;

        // a-b: effective key, possibly rotated, tweaked by the payload.
        let effective = match new_key {
            Some(key) => key,
            None => share.x_only()?,
        };
        let next_root = taproot::commitment_root(&effective, &diff.payload);
        let next_key = taproot::tweak_pubkey(&effective, &taproot::tweak(&effective, &diff.payload))?;
        let dest_address = taproot::p2tr_address(&next_key, &self.net_params)?;

        // Keep the wallet watching the tip so txid recovery can scan.
        let tip_script = taproot::taproot_script(&cursor.key)?;
        self.bitcoin
            .import_taproot_script(&tip_script, self.net_params.rescan_on_import)
            .await?;

        // c: resolve the tip txid if this node lost it.
        let previous_txid = if cursor.previous_txid.is_empty() {
            tracing::info!("previous checkpoint txid unknown, scanning");
            let tip_address = taproot::p2tr_address(&cursor.key, &self.net_params)?;
            match self.bitcoin.wallet_txid_for_address(&tip_address).await? {
                Some(txid) => txid,
                None => self
                    .bitcoin
                    .scan_tipward(&tip_script)
                    .await?
                    .ok_or(CheckpointError::MissingPreviousTxid)?,
            }
        } else {
            cursor.previous_txid.clone()
        };

        // d: the checkpoint output is at index 0; fall back to 1 when the
        // node reports a non-taproot script there (seed transactions may
        // carry change at index 0).
        let (vout, utxo) = self.resolve_tip_utxo(&previous_txid).await?;

        // e: fee is a static policy value; underflow is fatal before any
        // transaction is built.
        if utxo.value_sats <= self.fee_sats {
            return Err(CheckpointError::FeeUnderflow {
                value_sats: utxo.value_sats,
                fee_sats: self.fee_sats,
            });
        }
        let next_value = utxo.value_sats - self.fee_sats;

        let prev = PrevOut {
            txid: previous_txid.clone(),
            vout,
        };
        let raw_tx = self
            .bitcoin
            .create_raw_transaction(&prev, &dest_address, next_value, &roster_hash)
            .await?;

        // f: BIP-341 sighash with the spent output committed.
        let tx_bytes = hex::decode(&raw_tx)
            .map_err(|e| TaprootError::MalformedTransaction(e.to_string()))?;
        let spent = taproot::encode_prevout(utxo.value_sats, &utxo.script_pubkey);
        let sighash = taproot::key_spend_sighash(&tx_bytes, &spent, 0x00)?;

        // g: threshold signing over the roster bound to the active
        // share. The old set signs the rotation checkpoint; the new set
        // takes over from the next period.
        tracing::info!(
            txid = %previous_txid,
            signers = ?roster,
            "signing checkpoint transaction"
        );
        let signature = sign_with_tweak(
            &self.hub,
            &share,
            &roster,
            &sighash,
            &cursor.commitment_root,
            self.round_timeout,
        )
        .await?;

        // h: witness + broadcast. Every signer broadcasts the identical
        // transaction; the node deduplicates.
        let signed_tx = taproot::attach_witness(&raw_tx, &signature)?;
        let new_txid = self.bitcoin.send_raw_transaction(&signed_tx).await?;

        tracing::info!(
            txid = %new_txid,
            parent = %previous_txid,
            roster_hash = %hex::encode(roster_hash),
            "checkpoint broadcast"
        );

        // i: advance the cursor and commit any pending rotation.
        self.commit_checkpoint(diff, new_txid, next_key, next_root)
            .await
    }

    async fn commit_checkpoint(
        &self,
        diff: &CheckpointDiff,
        new_txid: String,
        next_key: [u8; 32],
        next_root: [u8; 32],
    ) -> Result<(), CheckpointError> {
        let mut to_persist: Option<TaprootShare> = None;
        let mut retired = false;
        {
            let mut state = self.state.lock().await;
            state.cursor.previous_txid = new_txid;
            state.cursor.key = next_key;
            state.cursor.commitment_root = next_root;

            if let Some(next_share) = state.new_share.take() {
                to_persist = Some(next_share.clone());
                state.share = Some(next_share);
            }
            if state.new_key.take().is_some() {
                state.roster = if state.new_roster.is_empty() {
                    // This node did not take part in the DKG (it is
                    // leaving); the watcher's view of the actor is the
                    // authority on the new roster.
                    let mut members = diff.members.clone();
                    members.sort();
                    members.dedup();
                    members
                } else {
                    std::mem::take(&mut state.new_roster)
                };
                state.new_roster = Vec::new();

                if !state.roster.iter().any(|m| m == &self.node_id) {
                    // Excluded from the new roster: this share cannot
                    // sign under the rotated key; retire it.
                    tracing::info!("left the signer set, retiring taproot share");
                    state.share = None;
                    to_persist = None;
                    retired = true;
                }
            }
        }

        if let Some(share) = to_persist {
            share.save(&self.share_path)?;
            let _ = std::fs::remove_file(staged_share_path(&self.share_path));
        }
        if retired {
            // Park the stale file so the next startup comes back as a
            // bare observer instead of failing on a key it cannot spend.
            if let Err(e) =
                std::fs::rename(&self.share_path, retired_share_path(&self.share_path))
            {
                tracing::warn!(error = %e, "could not retire the share file");
            }
        }
        Ok(())
    }

    /// An observer that just finished its first DKG adopts the new key:
    /// the old set is broadcasting the rotation checkpoint right now,
    /// and its output is derived from the new group key and this very
    /// payload.
    async fn promote_observer(&self, diff: &CheckpointDiff) -> Result<(), CheckpointError> {
        let (promoted, tip_key) = {
            let mut state = self.state.lock().await;
            let Some(next_share) = state.new_share.take() else {
                return Ok(());
            };
            let group_key = next_share.x_only()?;
            let root = taproot::commitment_root(&group_key, &diff.payload);
            let key =
                taproot::tweak_pubkey(&group_key, &taproot::tweak(&group_key, &diff.payload))?;

            state.roster = if state.new_roster.is_empty() {
                next_share.participants()
            } else {
                std::mem::take(&mut state.new_roster)
            };
            state.new_key = None;
            state.cursor = CheckpointCursor {
                previous_txid: String::new(),
                key,
                commitment_root: root,
            };
            state.share = Some(next_share.clone());
            (next_share, key)
        };

        // Watch the incoming checkpoint output; the tip txid resolves by
        // scan once it lands.
        let script = taproot::taproot_script(&tip_key)?;
        self.bitcoin
            .import_taproot_script(&script, self.net_params.rescan_on_import)
            .await?;

        promoted.save(&self.share_path)?;
        let _ = std::fs::remove_file(staged_share_path(&self.share_path));

        tracing::info!("promoted from observer to signer under the new group key");
        Ok(())
    }

    async fn resolve_tip_utxo(&self, txid: &str) -> Result<(u32, Utxo), CheckpointError> {
        for vout in [0u32, 1u32] {
            if let Some(utxo) = self.bitcoin.tx_out(txid, vout).await? {
                if utxo.script_pubkey.first() == Some(&0x51) {
                    return Ok((vout, utxo));
                }
                tracing::warn!(txid, vout, "output is not taproot, retrying next index");
            }
        }
        Err(CheckpointError::UtxoNotFound {
            txid: txid.to_string(),
        })
    }
}

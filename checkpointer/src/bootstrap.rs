//! Startup: share loading, anchor seeding and tip recovery.
//!
//! Bootstrap runs once per process. It fail-fasts on an unreachable
//! Bitcoin node, loads this node's share material from disk, lets the
//! configured seeder fund the very first anchor UTXO, then walks the
//! anchor chain on Bitcoin - funding transaction, spender by spender -
//! to the tip checkpoint, rebuilding the cursor and the authoritative
//! roster from the referenced roster blobs. Restarting against the same
//! on-chain state yields the same cursor and leaves the share file
//! untouched.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use frost_engine::{SessionHub, ShareError, TaprootShare};

use crate::bitcoin_rpc::{BitcoinApi, RpcError};
use crate::config::Config;
use crate::coordinator::{
    staged_share_path, CheckpointCursor, Coordinator, CoordinatorState,
};
use crate::host::{HostApi, HostError, TipsetKey};
use crate::roster::{Roster, RosterError};
use crate::store::{RosterStore, StoreError};
use crate::taproot::{self, TaprootError};
use crate::watcher::EpochWatcher;

/// How long to wait for the funding transaction to become visible.
const FUNDING_POLL_ATTEMPTS: u32 = 30;
const FUNDING_POLL_DELAY: Duration = Duration::from_secs(2);

/// Bootstrap errors. All of them abort startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("funding transaction not visible after {0} attempts")]
    FundingNotVisible(u32),
    #[error("wallet balance of {balance_sats} sat cannot cover the fee of {fee_sats} sat")]
    SeedUnderflow { balance_sats: u64, fee_sats: u64 },
    #[error("chain references roster blob {0} but the store does not have it")]
    RosterMissing(String),
    #[error("roster blob {0} does not match its content address")]
    RosterMismatch(String),
    #[error("tip checkpoint {txid} does not match the recovered key; share material is stale")]
    CursorMismatch { txid: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error(transparent)]
    Taproot(#[from] TaprootError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Roster(#[from] RosterError),
}

/// Bring a node up and hand back its coordinator and watcher, wired to
/// the same state.
pub async fn bootstrap(
    config: &Config,
    host: Arc<dyn HostApi>,
    bitcoin: Arc<dyn BitcoinApi>,
    store: Arc<dyn RosterStore>,
    hub: Arc<SessionHub>,
) -> Result<(Arc<Coordinator>, EpochWatcher), BootstrapError> {
    // 1. The Bitcoin node is load-bearing for everything below.
    bitcoin.ping().await?;
    tracing::info!("bitcoin node reachable");

    // 2. The genesis tipset key is the first checkpoint payload.
    let genesis = host.genesis_key().await?;

    // 3. Share material from operator-controlled storage.
    let share = if config.share_path.exists() {
        Some(TaprootShare::load(&config.share_path, &config.node_id)?)
    } else {
        None
    };
    let staged = staged_share_path(&config.share_path);
    let new_share = if staged.exists() {
        Some(TaprootShare::load(&staged, &config.node_id)?)
    } else {
        None
    };

    let mut state = CoordinatorState::default();
    let mut latest_checkpoint = None;

    if let Some(share) = &share {
        let group_key = share.x_only()?;
        let first_root = taproot::commitment_root(&group_key, genesis.as_bytes());
        let first_key =
            taproot::tweak_pubkey(&group_key, &taproot::tweak(&group_key, genesis.as_bytes()))?;
        let first_script = taproot::taproot_script(&first_key)?;
        let first_address = taproot::p2tr_address(&first_key, &config.network_params())?;

        let params = config.network_params();
        bitcoin
            .import_taproot_script(&first_script, params.rescan_on_import)
            .await?;

        // Only the seeder creates the first funded UTXO, and only when
        // the anchor chain is empty.
        if config.is_leader() && find_paying_tx(bitcoin.as_ref(), &first_script).await?.is_none() {
            let value_sats = match config.funding_sats {
                Some(fixed) => fixed,
                None => {
                    let balance = bitcoin.wallet_balance().await?;
                    if balance <= config.fee_sats {
                        return Err(BootstrapError::SeedUnderflow {
                            balance_sats: balance,
                            fee_sats: config.fee_sats,
                        });
                    }
                    balance - config.fee_sats
                }
            };
            let txid = bitcoin.send_to_address(&first_address, value_sats).await?;
            tracing::info!(%txid, address = %first_address, value_sats, "seeded the anchor chain");
        }

        // 4. Wait for the funding transaction.
        let funding_txid = poll_for_funding(bitcoin.as_ref(), &first_script).await?;
        tracing::info!(txid = %funding_txid, "anchor chain funding transaction found");

        // 5. Walk the anchor chain to the tip checkpoint.
        let mut tip = funding_txid.clone();
        let mut payload = genesis.as_bytes().to_vec();
        let mut roster = share.participants();

        while let Some(spender) = bitcoin.wallet_spender_of(&tip).await? {
            let info = bitcoin.raw_transaction(&spender).await?;
            if let Some(hash) = info.output_scripts.iter().find_map(|s| op_return32(s)) {
                match store.get(&hash).await? {
                    Some(blob) => {
                        // a store answer that does not hash back to the
                        // key is unusable
                        if Roster::content_hash(&blob) != hash {
                            return Err(BootstrapError::RosterMismatch(hex::encode(hash)));
                        }
                        let (blob_payload, blob_roster) = Roster::parse(&blob)?;
                        payload = blob_payload;
                        roster = blob_roster.members().to_vec();
                        latest_checkpoint = Some(TipsetKey(payload.clone()));
                    }
                    // The chain pins this roster; without it recovery
                    // cannot continue.
                    None => return Err(BootstrapError::RosterMissing(hex::encode(hash))),
                }
            }
            tip = spender;
        }

        let cursor = if tip == funding_txid {
            CheckpointCursor {
                previous_txid: funding_txid,
                key: first_key,
                commitment_root: first_root,
            }
        } else {
            let root = taproot::commitment_root(&group_key, &payload);
            let key =
                taproot::tweak_pubkey(&group_key, &taproot::tweak(&group_key, &payload))?;
            let expected_script = taproot::taproot_script(&key)?;
            let info = bitcoin.raw_transaction(&tip).await?;
            if !info
                .output_scripts
                .iter()
                .any(|s| s.as_slice() == expected_script.as_slice())
            {
                // The key rotated while this node was down; its share
                // cannot spend the tip. Operator intervention required.
                return Err(BootstrapError::CursorMismatch { txid: tip });
            }
            bitcoin
                .import_taproot_script(&expected_script, params.rescan_on_import)
                .await?;
            CheckpointCursor {
                previous_txid: tip,
                key,
                commitment_root: root,
            }
        };

        tracing::info!(
            txid = %cursor.previous_txid,
            key = %hex::encode(cursor.key),
            ?roster,
            "recovered anchor chain tip"
        );

        state.roster = roster;
        state.cursor = cursor;
    } else {
        tracing::info!("no share on disk, starting as bare observer");
    }

    let start_synced = share.is_some();
    state.share = share;
    if let Some(next) = new_share {
        state.new_key = Some(next.x_only()?);
        state.new_roster = next.participants();
        state.new_share = Some(next);
    }

    // 6. Wire the coordinator and the watcher to the same state.
    let coordinator = Arc::new(Coordinator::new(config, host.clone(), bitcoin, store.clone(), hub, state));
    let watcher = EpochWatcher::new(
        host,
        store,
        coordinator.state(),
        &config.node_id,
        config.checkpoint_period,
        start_synced,
        latest_checkpoint,
    );

    Ok((coordinator, watcher))
}

/// First wallet transaction with an output paying exactly `script`, at
/// any output index. Seed transactions may carry change at index 0.
async fn find_paying_tx(
    bitcoin: &dyn BitcoinApi,
    script: &[u8],
) -> Result<Option<String>, RpcError> {
    for txid in bitcoin.wallet_transactions().await? {
        let tx = bitcoin.raw_transaction(&txid).await?;
        if tx.output_scripts.iter().any(|s| s.as_slice() == script) {
            return Ok(Some(txid));
        }
    }
    Ok(None)
}

async fn poll_for_funding(
    bitcoin: &dyn BitcoinApi,
    script: &[u8],
) -> Result<String, BootstrapError> {
    for attempt in 0..FUNDING_POLL_ATTEMPTS {
        if let Some(txid) = find_paying_tx(bitcoin, script).await? {
            return Ok(txid);
        }
        tracing::debug!(attempt, "funding transaction not visible yet");
        sleep(FUNDING_POLL_DELAY).await;
    }
    Err(BootstrapError::FundingNotVisible(FUNDING_POLL_ATTEMPTS))
}

/// Extract the 32-byte payload of an `OP_RETURN <32 bytes>` script.
fn op_return32(script: &[u8]) -> Option<[u8; 32]> {
    if script.len() == 34 && script[0] == 0x6a && script[1] == 0x20 {
        let mut out = [0u8; 32];
        out.copy_from_slice(&script[2..]);
        Some(out)
    } else {
        None
    }
}

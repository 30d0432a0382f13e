//! End-to-end checkpoint scenarios against deterministic fakes.
//!
//! `FakeBitcoin` keeps a consensus-valid transaction graph and verifies
//! every broadcast witness with a real Schnorr check, `MockHost` serves
//! validator-set state per height, and nodes coordinate over the
//! in-process pubsub hub. Each test drives tipset transitions in
//! lockstep: watchers observe first, then every online coordinator
//! handles its diff concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{schnorr, Message, Secp256k1};
use bitcoin::{
    absolute, transaction, Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness, XOnlyPublicKey,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use checkpointer::{
    bootstrap, taproot, BitcoinApi, BootstrapError, CheckpointError, Config, Coordinator,
    EpochWatcher, HostApi, HostError, MemoryRosterStore, Network, PrevOut, Roster, RosterStore,
    RpcError, Tipset, TipsetKey, Transition, TxInfo, Utxo, ValidatorSet,
};
use frost_engine::{keygen as frost_keygen, MemoryPubsub, PubsubNet, SessionHub, TaprootShare};

// ---------------------------------------------------------------------
// FakeBitcoin: an in-memory regtest node with a real-signature mempool
// ---------------------------------------------------------------------

#[derive(Default)]
struct ChainState {
    txs: HashMap<String, Transaction>,
    /// Insertion order; newest last.
    order: Vec<String>,
    spent: HashSet<(String, u32)>,
    create_raw_calls: u32,
    seed_counter: u8,
}

struct FakeBitcoin {
    chain: Mutex<ChainState>,
    balance_sats: u64,
    /// Put wallet change at output 0 of seed transactions, pushing the
    /// taproot output to index 1.
    change_first: bool,
}

impl FakeBitcoin {
    fn new(balance_sats: u64, change_first: bool) -> Arc<Self> {
        Arc::new(Self {
            chain: Mutex::new(ChainState::default()),
            balance_sats,
            change_first,
        })
    }

    async fn txids(&self) -> Vec<String> {
        self.chain.lock().await.order.clone()
    }

    async fn tx(&self, txid: &str) -> Transaction {
        self.chain.lock().await.txs[txid].clone()
    }

    async fn create_raw_calls(&self) -> u32 {
        self.chain.lock().await.create_raw_calls
    }

    fn regtest_address(address: &str) -> Result<Address, RpcError> {
        Address::from_str(address)
            .map_err(|e| RpcError::Malformed(e.to_string()))?
            .require_network(bitcoin::Network::Regtest)
            .map_err(|e| RpcError::Malformed(e.to_string()))
    }

    fn insert(chain: &mut ChainState, tx: Transaction) -> String {
        let txid = tx.compute_txid().to_string();
        for input in &tx.input {
            chain
                .spent
                .insert((input.previous_output.txid.to_string(), input.previous_output.vout));
        }
        chain.order.push(txid.clone());
        chain.txs.insert(txid.clone(), tx);
        txid
    }
}

#[async_trait]
impl BitcoinApi for FakeBitcoin {
    async fn ping(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn import_taproot_script(&self, _script: &[u8], _rescan: bool) -> Result<(), RpcError> {
        Ok(())
    }

    async fn wallet_txid_for_address(&self, address: &str) -> Result<Option<String>, RpcError> {
        let script = Self::regtest_address(address)?.script_pubkey();
        let chain = self.chain.lock().await;
        for txid in chain.order.iter().rev() {
            if chain.txs[txid]
                .output
                .iter()
                .any(|out| out.script_pubkey == script)
            {
                return Ok(Some(txid.clone()));
            }
        }
        Ok(None)
    }

    async fn tx_out(&self, txid: &str, vout: u32) -> Result<Option<Utxo>, RpcError> {
        let chain = self.chain.lock().await;
        if chain.spent.contains(&(txid.to_string(), vout)) {
            return Ok(None);
        }
        let Some(tx) = chain.txs.get(txid) else {
            return Ok(None);
        };
        let Some(output) = tx.output.get(vout as usize) else {
            return Ok(None);
        };
        // provably unspendable outputs never enter the UTXO set
        if output.script_pubkey.is_op_return() {
            return Ok(None);
        }
        Ok(Some(Utxo {
            value_sats: output.value.to_sat(),
            script_pubkey: output.script_pubkey.to_bytes(),
        }))
    }

    async fn create_raw_transaction(
        &self,
        prev: &PrevOut,
        dest_address: &str,
        value_sats: u64,
        op_return: &[u8],
    ) -> Result<String, RpcError> {
        let dest = Self::regtest_address(dest_address)?.script_pubkey();
        let data = PushBytesBuf::try_from(op_return.to_vec())
            .map_err(|_| RpcError::Malformed("op_return too large".into()))?;
        let prev_txid =
            Txid::from_str(&prev.txid).map_err(|e| RpcError::Malformed(e.to_string()))?;

        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(prev_txid, prev.vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut {
                    value: Amount::from_sat(value_sats),
                    script_pubkey: dest,
                },
                TxOut {
                    value: Amount::from_sat(0),
                    script_pubkey: ScriptBuf::new_op_return(&data),
                },
            ],
        };

        let mut chain = self.chain.lock().await;
        chain.create_raw_calls += 1;
        Ok(encode::serialize_hex(&tx))
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
        let bytes = hex::decode(tx_hex).map_err(|e| RpcError::Malformed(e.to_string()))?;
        let tx: Transaction =
            encode::deserialize(&bytes).map_err(|e| RpcError::Malformed(e.to_string()))?;
        let txid = tx.compute_txid().to_string();

        let mut chain = self.chain.lock().await;
        if chain.txs.contains_key(&txid) {
            // every signer broadcasts the identical transaction
            return Ok(txid);
        }

        let outpoint = tx.input[0].previous_output;
        let prev_key = (outpoint.txid.to_string(), outpoint.vout);
        let prev_tx = chain.txs.get(&prev_key.0).ok_or_else(|| RpcError::Rpc {
            code: -25,
            message: "missing inputs".into(),
        })?;
        if chain.spent.contains(&prev_key) {
            return Err(RpcError::Rpc {
                code: -25,
                message: "inputs already spent".into(),
            });
        }
        let prevout = prev_tx.output[outpoint.vout as usize].clone();

        // enforce the taproot key-spend rules the real node would
        if prevout.script_pubkey.is_p2tr() {
            let witness = &tx.input[0].witness;
            if witness.len() != 1 {
                return Err(RpcError::Rpc {
                    code: -26,
                    message: "witness must be a single signature".into(),
                });
            }
            let sig = schnorr::Signature::from_slice(witness.iter().next().unwrap()).map_err(
                |_| RpcError::Rpc {
                    code: -26,
                    message: "malformed schnorr signature".into(),
                },
            )?;
            let spent =
                taproot::encode_prevout(prevout.value.to_sat(), prevout.script_pubkey.as_bytes());
            let sighash = taproot::key_spend_sighash(&encode::serialize(&tx), &spent, 0x00)
                .map_err(|e| RpcError::Malformed(e.to_string()))?;
            let key = XOnlyPublicKey::from_slice(&prevout.script_pubkey.as_bytes()[2..34])
                .map_err(|e| RpcError::Malformed(e.to_string()))?;
            Secp256k1::verification_only()
                .verify_schnorr(&sig, &Message::from_digest(sighash), &key)
                .map_err(|_| RpcError::Rpc {
                    code: -26,
                    message: "invalid schnorr signature".into(),
                })?;
        }

        Ok(Self::insert(&mut chain, tx))
    }

    async fn send_to_address(&self, address: &str, value_sats: u64) -> Result<String, RpcError> {
        let dest = Self::regtest_address(address)?.script_pubkey();
        let mut chain = self.chain.lock().await;
        chain.seed_counter += 1;

        // synthetic wallet input; never part of the tracked graph
        let seed: [u8; 32] = Sha256::digest([chain.seed_counter]).into();
        let funding_input = TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array(seed), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        };

        let target = TxOut {
            value: Amount::from_sat(value_sats),
            script_pubkey: dest,
        };
        let change = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::from(vec![0x00, 0x14, 0xcc]),
        };
        let output = if self.change_first {
            vec![change, target]
        } else {
            vec![target, change]
        };

        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![funding_input],
            output,
        };
        Ok(Self::insert(&mut chain, tx))
    }

    async fn wallet_balance(&self) -> Result<u64, RpcError> {
        Ok(self.balance_sats)
    }

    async fn wallet_transactions(&self) -> Result<Vec<String>, RpcError> {
        let chain = self.chain.lock().await;
        Ok(chain.order.iter().rev().cloned().collect())
    }

    async fn raw_transaction(&self, txid: &str) -> Result<TxInfo, RpcError> {
        let chain = self.chain.lock().await;
        let tx = chain.txs.get(txid).ok_or_else(|| RpcError::Rpc {
            code: -5,
            message: "no such transaction".into(),
        })?;
        Ok(TxInfo {
            txid: txid.to_string(),
            inputs: tx
                .input
                .iter()
                .map(|input| PrevOut {
                    txid: input.previous_output.txid.to_string(),
                    vout: input.previous_output.vout,
                })
                .collect(),
            output_scripts: tx
                .output
                .iter()
                .map(|out| out.script_pubkey.to_bytes())
                .collect(),
            output_values: tx.output.iter().map(|out| out.value.to_sat()).collect(),
        })
    }
}

// ---------------------------------------------------------------------
// MockHost: validator-set state per height range
// ---------------------------------------------------------------------

#[derive(Default)]
struct HostState {
    /// Validator sets, effective from the given height.
    miners: BTreeMap<u64, Vec<String>>,
    /// Actor-registered group keys, effective from the given height.
    keys: BTreeMap<u64, Vec<u8>>,
    published: Vec<[u8; 32]>,
}

struct MockHost {
    state: Mutex<HostState>,
}

fn tipset(height: u64) -> Tipset {
    Tipset {
        height,
        key: TipsetKey(format!("ts{height}").into_bytes()),
    }
}

fn tipset_height(key: &TipsetKey) -> u64 {
    std::str::from_utf8(key.as_bytes())
        .ok()
        .and_then(|s| s.strip_prefix("ts"))
        .and_then(|s| s.parse().ok())
        .expect("mock tipset keys encode their height")
}

impl MockHost {
    fn new(initial_miners: Vec<String>) -> Arc<Self> {
        let mut miners = BTreeMap::new();
        miners.insert(0, initial_miners);
        Arc::new(Self {
            state: Mutex::new(HostState {
                miners,
                keys: BTreeMap::new(),
                published: Vec::new(),
            }),
        })
    }

    async fn set_miners_from(&self, height: u64, miners: Vec<String>) {
        self.state.lock().await.miners.insert(height, miners);
    }

    async fn set_group_key_from(&self, height: u64, key: [u8; 32]) {
        self.state.lock().await.keys.insert(height, key.to_vec());
    }

    async fn published(&self) -> Vec<[u8; 32]> {
        self.state.lock().await.published.clone()
    }
}

#[async_trait]
impl HostApi for MockHost {
    async fn genesis_key(&self) -> Result<TipsetKey, HostError> {
        Ok(tipset(0).key)
    }

    async fn validator_set(&self, at: &TipsetKey) -> Result<ValidatorSet, HostError> {
        let height = tipset_height(at);
        let state = self.state.lock().await;
        let miners = state
            .miners
            .range(..=height)
            .next_back()
            .map(|(_, m)| m.clone())
            .unwrap_or_default();
        let public_key = state
            .keys
            .range(..=height)
            .next_back()
            .map(|(_, k)| k.clone())
            .unwrap_or_default();
        Ok(ValidatorSet { miners, public_key })
    }

    async fn sync_reached(&self, _height: u64) -> Result<bool, HostError> {
        Ok(true)
    }

    async fn has_tipset(&self, _key: &TipsetKey) -> Result<bool, HostError> {
        Ok(true)
    }

    async fn publish_group_key(&self, key: &[u8; 32]) -> Result<(), HostError> {
        self.state.lock().await.published.push(*key);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Cluster harness
// ---------------------------------------------------------------------

struct Node {
    coordinator: Arc<Coordinator>,
    watcher: EpochWatcher,
    share_path: std::path::PathBuf,
}

struct Cluster {
    bitcoin: Arc<FakeBitcoin>,
    store: Arc<MemoryRosterStore>,
    host: Arc<MockHost>,
    hubs: HashMap<String, Arc<SessionHub>>,
    nodes: HashMap<String, Node>,
    _dir: tempfile::TempDir,
}

struct ClusterOptions {
    fee_sats: u64,
    funding_sats: Option<u64>,
    change_first: bool,
    round_timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            fee_sats: 1_000,
            funding_sats: None,
            change_first: false,
            round_timeout: Duration::from_secs(5),
        }
    }
}

const WALLET_SATS: u64 = 5_000_000_000; // 50 BTC

impl Cluster {
    /// Stand up signers (with a fresh DKG written to disk) plus bare
    /// observers, then bootstrap every node.
    async fn start(signers: &[&str], observers: &[&str], opts: ClusterOptions) -> Cluster {
        let dir = tempfile::tempdir().unwrap();
        let bitcoin = FakeBitcoin::new(WALLET_SATS, opts.change_first);
        let store = Arc::new(MemoryRosterStore::new());
        let net = Arc::new(MemoryPubsub::new());
        let host = MockHost::new(signers.iter().map(|s| s.to_string()).collect());

        let mut hubs = HashMap::new();
        for id in signers.iter().chain(observers) {
            let pubsub: Arc<dyn PubsubNet> = Arc::clone(&net) as Arc<dyn PubsubNet>;
            hubs.insert(
                id.to_string(),
                SessionHub::start(pubsub, id).await.unwrap(),
            );
        }

        // pre-generate the genesis signer shares, like an operator would
        let roster: Vec<String> = signers.iter().map(|s| s.to_string()).collect();
        let mut dkg = JoinSet::new();
        for id in signers {
            let hub = Arc::clone(&hubs[*id]);
            let roster = roster.clone();
            dkg.spawn(async move { frost_keygen(&hub, &roster, Duration::from_secs(10)).await });
        }
        let mut shares: Vec<TaprootShare> = Vec::new();
        while let Some(result) = dkg.join_next().await {
            shares.push(result.unwrap().unwrap());
        }
        for share in &shares {
            share
                .save(&dir.path().join(format!("{}-share.toml", share.id())))
                .unwrap();
        }

        let mut cluster = Cluster {
            bitcoin,
            store,
            host,
            hubs,
            nodes: HashMap::new(),
            _dir: dir,
        };
        // leader first so the chain is seeded before the others poll
        for id in signers.iter().chain(observers) {
            cluster.boot_node(id, signers[0], &opts).await;
        }
        cluster
    }

    fn config(&self, id: &str, leader: &str, opts: &ClusterOptions) -> Config {
        Config {
            node_id: id.to_string(),
            network: Network::Regtest,
            bitcoin_rpc_url: "http://unused.invalid".to_string(),
            bitcoin_rpc_user: None,
            bitcoin_rpc_pass: None,
            fee_sats: opts.fee_sats,
            checkpoint_period: 15,
            leader: leader.to_string(),
            share_path: self._dir.path().join(format!("{id}-share.toml")),
            roster_store_url: None,
            funding_sats: opts.funding_sats,
            round_timeout: opts.round_timeout,
            log_level: "info".to_string(),
        }
    }

    async fn boot_node(&mut self, id: &str, leader: &str, opts: &ClusterOptions) {
        let config = self.config(id, leader, opts);
        let (coordinator, watcher) = bootstrap(
            &config,
            Arc::clone(&self.host) as Arc<dyn HostApi>,
            Arc::clone(&self.bitcoin) as Arc<dyn BitcoinApi>,
            Arc::clone(&self.store) as Arc<dyn checkpointer::RosterStore>,
            Arc::clone(&self.hubs[id]),
        )
        .await
        .unwrap();
        self.nodes.insert(
            id.to_string(),
            Node {
                coordinator,
                watcher,
                share_path: config.share_path,
            },
        );
    }

    /// Drive one tipset transition through the online nodes: watchers
    /// observe sequentially, coordinators handle their diffs together.
    async fn drive(&mut self, height: u64, online: &[&str]) -> HashMap<String, Result<(), String>> {
        let transition = Transition {
            old: tipset(height - 1),
            new: tipset(height),
        };

        let mut set = JoinSet::new();
        for id in online {
            let node = self.nodes.get_mut(*id).expect("node exists");
            let diff = node.watcher.observe(&transition).await.unwrap();
            if let Some(diff) = diff {
                let coordinator = Arc::clone(&node.coordinator);
                let id = id.to_string();
                set.spawn(async move {
                    let result = coordinator.handle_diff(diff).await;
                    (id, result.map_err(|e: CheckpointError| e.to_string()))
                });
            }
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (id, result) = joined.unwrap();
            results.insert(id, result);
        }
        results
    }

    /// Drive heights `from..=to` with every listed node online,
    /// asserting nothing fails.
    async fn advance(&mut self, from: u64, to: u64, online: &[&str]) {
        for height in from..=to {
            let results = self.drive(height, online).await;
            for (id, result) in results {
                if let Err(e) = result {
                    panic!("node {id} failed at height {height}: {e}");
                }
            }
        }
    }

    async fn cursor_of(&self, id: &str) -> checkpointer::CheckpointCursor {
        self.nodes[id].coordinator.state().lock().await.cursor.clone()
    }

    async fn group_key_of(&self, id: &str) -> [u8; 32] {
        let state = self.nodes[id].coordinator.state();
        let state = state.lock().await;
        state.share.as_ref().unwrap().x_only().unwrap()
    }
}

/// Index of the checkpoint-bearing output of a seed transaction.
fn taproot_vout(tx: &Transaction) -> u32 {
    tx.output
        .iter()
        .position(|out| out.script_pubkey.is_p2tr())
        .expect("transaction has a taproot output") as u32
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

/// Cold start: three signers, one checkpoint at the first cadence
/// boundary, with the exact on-chain format.
#[tokio::test(flavor = "multi_thread")]
async fn cold_start_three_signers() {
    let ids = ["A", "B", "C"];
    let mut cluster = Cluster::start(&ids, &[], ClusterOptions::default()).await;

    // funding transaction is on chain after bootstrap
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 1);
    let funding_txid = txids[0].clone();

    // nothing happens before the boundary
    cluster.advance(1, 14, &ids).await;
    assert_eq!(cluster.bitcoin.txids().await.len(), 1);

    cluster.advance(15, 15, &ids).await;
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 2, "exactly one checkpoint broadcast");
    let checkpoint_txid = txids[1].clone();

    let funding = cluster.bitcoin.tx(&funding_txid).await;
    let checkpoint = cluster.bitcoin.tx(&checkpoint_txid).await;

    // input 0 spends the funding taproot output
    assert_eq!(
        checkpoint.input[0].previous_output,
        OutPoint::new(Txid::from_str(&funding_txid).unwrap(), taproot_vout(&funding)),
    );

    // output 0: OP_1 <32-byte tweaked key> for the next checkpoint
    let out0 = checkpoint.output[0].script_pubkey.to_bytes();
    assert_eq!(out0.len(), 34);
    assert_eq!(out0[0], 0x51);
    let group_key = cluster.group_key_of("A").await;
    let payload = tipset(14).key.0;
    let expected_key =
        taproot::tweak_pubkey(&group_key, &taproot::tweak(&group_key, &payload)).unwrap();
    assert_eq!(&out0[2..], expected_key);

    // output 1: OP_RETURN <32-byte roster hash>, blob = hex(payload) + ids
    let out1 = checkpoint.output[1].script_pubkey.to_bytes();
    assert_eq!(out1[0], 0x6a);
    assert_eq!(out1[1], 0x20);
    let mut blob = hex::encode(&payload).into_bytes();
    blob.extend_from_slice(b"\nA\nB\nC\n");
    assert_eq!(&out1[2..], Roster::content_hash(&blob));
    let stored = cluster
        .store
        .get(&Roster::content_hash(&blob))
        .await
        .unwrap()
        .expect("roster blob published");
    let (stored_payload, stored_roster) = Roster::parse(&stored).unwrap();
    assert_eq!(stored_payload, payload);
    assert_eq!(stored_roster.members(), ["A", "B", "C"]);

    // fee deducted from the spent value
    let spent_value = funding.output[taproot_vout(&funding) as usize].value.to_sat();
    assert_eq!(checkpoint.output[0].value.to_sat(), spent_value - 1_000);

    // every node's cursor advanced to the new tip
    for id in ids {
        let cursor = cluster.cursor_of(id).await;
        assert_eq!(cursor.previous_txid, checkpoint_txid);
        assert_eq!(cursor.key, expected_key);
    }

    // cadence: nothing new until the next boundary
    cluster.advance(16, 29, &ids).await;
    assert_eq!(cluster.bitcoin.txids().await.len(), 2);
    cluster.advance(30, 30, &ids).await;
    assert_eq!(cluster.bitcoin.txids().await.len(), 3);
}

/// Validator rotation: the old set signs the checkpoint that commits to
/// the new group key; the new set (including the joiner) signs the next
/// one; the leaver retires.
#[tokio::test(flavor = "multi_thread")]
async fn validator_rotation() {
    let all = ["A", "B", "C", "D"];
    let mut cluster = Cluster::start(&["A", "B", "C"], &["D"], ClusterOptions::default()).await;

    let old_key = cluster.group_key_of("A").await;

    cluster.advance(1, 15, &all).await;
    assert_eq!(cluster.bitcoin.txids().await.len(), 2);

    // the actor yields {A, B, D} -> DKG among the new set
    cluster
        .host
        .set_miners_from(20, vec!["A".into(), "B".into(), "D".into()])
        .await;
    cluster.advance(16, 20, &all).await;

    // exactly one method-4 publication, and a new key came out of it
    let published = cluster.host.published().await;
    assert_eq!(published.len(), 1, "only the leader publishes");
    let new_key = published[0];
    assert_ne!(new_key, old_key);

    // the registered key becomes visible on the actor one epoch later
    cluster.host.set_group_key_from(21, new_key).await;
    cluster.advance(21, 29, &all).await;

    // rotation checkpoint at 30: committed to the NEW key
    cluster.advance(30, 30, &all).await;
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 3);
    let rotation = cluster.bitcoin.tx(&txids[2]).await;
    let payload_30 = tipset(29).key.0;
    let expected_30 =
        taproot::tweak_pubkey(&new_key, &taproot::tweak(&new_key, &payload_30)).unwrap();
    assert_eq!(&rotation.output[0].script_pubkey.to_bytes()[2..], expected_30);

    // C signed it with the old share, then retired
    {
        let state = cluster.nodes["C"].coordinator.state();
        let state = state.lock().await;
        assert!(state.share.is_none(), "leaver retires its share");
    }
    let c_share = &cluster.nodes["C"].share_path;
    assert!(!c_share.exists(), "retired share file is parked aside");
    assert!(checkpointer::coordinator::retired_share_path(c_share).exists());
    // A, B and D now hold the new share
    for id in ["A", "B", "D"] {
        assert_eq!(cluster.group_key_of(id).await, new_key);
        let state = cluster.nodes[id].coordinator.state();
        let state = state.lock().await;
        assert_eq!(state.roster, vec!["A".to_string(), "B".to_string(), "D".to_string()]);
    }

    // checkpoint at 45 is signed by {A, B, D} under the rotated key
    cluster.advance(31, 45, &["A", "B", "D"]).await;
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 4);
    let next = cluster.bitcoin.tx(&txids[3]).await;
    assert_eq!(
        next.input[0].previous_output.txid.to_string(),
        txids[2],
        "checkpoint chain is unbroken across the rotation"
    );
    for id in ["A", "B", "D"] {
        assert_eq!(cluster.cursor_of(id).await.previous_txid, txids[3]);
    }
}

/// A node that joins the roster in the very transition landing on a
/// cadence boundary holds no share material when the diff is cut: it
/// runs the DKG but skips that boundary, leaving the checkpoint to the
/// established set.
#[tokio::test(flavor = "multi_thread")]
async fn joiner_on_boundary_skips_that_checkpoint() {
    let all = ["A", "B", "C", "D"];
    let mut cluster = Cluster::start(&["A", "B", "C"], &["D"], ClusterOptions::default()).await;

    let old_key = cluster.group_key_of("A").await;
    cluster.advance(1, 15, &all).await;
    assert_eq!(cluster.bitcoin.txids().await.len(), 2);

    // D enters exactly on the next boundary
    cluster
        .host
        .set_miners_from(30, vec!["A".into(), "B".into(), "C".into(), "D".into()])
        .await;
    cluster.advance(16, 30, &all).await;

    // exactly one checkpoint at 30, produced by the established set and
    // committed to the key the DKG with D just generated
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 3, "the boundary still yields one checkpoint");
    let published = cluster.host.published().await;
    assert_eq!(published.len(), 1);
    let new_key = published[0];
    assert_ne!(new_key, old_key);
    let checkpoint = cluster.bitcoin.tx(&txids[2]).await;
    let payload_30 = tipset(29).key.0;
    let expected =
        taproot::tweak_pubkey(&new_key, &taproot::tweak(&new_key, &payload_30)).unwrap();
    assert_eq!(&checkpoint.output[0].script_pubkey.to_bytes()[2..], expected);

    // D took part in the DKG but was not checkpoint-eligible in the
    // transition it joined: no checkpoint attempt, no promotion
    {
        let state = cluster.nodes["D"].coordinator.state();
        let state = state.lock().await;
        assert!(state.share.is_none(), "joiner skips its joining boundary");
        assert!(state.new_share.is_some(), "the DKG itself completed");
        assert!(state.cursor.previous_txid.is_empty());
    }
}

/// An absent signer aborts the round; the UTXO stays targeted and the
/// next boundary succeeds against the same tip.
#[tokio::test(flavor = "multi_thread")]
async fn absent_signer_aborts_then_recovers() {
    let ids = ["A", "B", "C"];
    let mut cluster = Cluster::start(
        &ids,
        &[],
        ClusterOptions {
            round_timeout: Duration::from_millis(800),
            ..ClusterOptions::default()
        },
    )
    .await;

    cluster.advance(1, 15, &ids).await;
    let tip_before = cluster.cursor_of("A").await.previous_txid;
    assert_eq!(cluster.bitcoin.txids().await.len(), 2);

    // B is offline at the next boundary: signing times out for A and C
    cluster.advance(16, 29, &["A", "C"]).await;
    let results = cluster.drive(30, &["A", "C"]).await;
    for id in ["A", "C"] {
        let err = results[id].as_ref().unwrap_err();
        assert!(err.contains("timed out"), "unexpected error: {err}");
    }
    assert_eq!(cluster.bitcoin.txids().await.len(), 2, "no broadcast");
    assert_eq!(cluster.cursor_of("A").await.previous_txid, tip_before);

    // B comes back; the next boundary spends the same UTXO
    cluster.advance(31, 44, &ids).await;
    cluster.advance(45, 45, &ids).await;
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 3);
    let recovered = cluster.bitcoin.tx(&txids[2]).await;
    assert_eq!(recovered.input[0].previous_output.txid.to_string(), tip_before);
}

/// Restart recovery: a rebooted node finds the tip by walking the
/// anchor chain, without replaying any signatures.
#[tokio::test(flavor = "multi_thread")]
async fn restart_recovers_cursor_from_chain() {
    let ids = ["A", "B", "C"];
    let opts = ClusterOptions::default();
    let mut cluster = Cluster::start(&ids, &[], ClusterOptions::default()).await;

    cluster.advance(1, 30, &ids).await;
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 3); // funding + checkpoints at 15 and 30
    let tip = cluster.cursor_of("A").await;

    let share_file_before = std::fs::read(&cluster.nodes["A"].share_path).unwrap();

    // kill A and bring it back against the same chain state
    cluster.nodes.remove("A");
    cluster.boot_node("A", "A", &opts).await;

    let recovered = cluster.cursor_of("A").await;
    assert_eq!(recovered.previous_txid, txids[2]);
    assert_eq!(recovered, tip);
    {
        let state = cluster.nodes["A"].coordinator.state();
        let state = state.lock().await;
        assert_eq!(state.roster, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }

    // bootstrap is idempotent: same cursor, byte-equal share file
    let share_file_after = std::fs::read(&cluster.nodes["A"].share_path).unwrap();
    assert_eq!(share_file_before, share_file_after);
    cluster.nodes.remove("A");
    cluster.boot_node("A", "A", &opts).await;
    assert_eq!(cluster.cursor_of("A").await, recovered);

    // and the recovered node keeps checkpointing with the others
    cluster.advance(31, 45, &ids).await;
    assert_eq!(cluster.bitcoin.txids().await.len(), 4);
}

/// Bootstrap refuses a roster blob whose bytes do not hash back to the
/// content address the chain references.
#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_rejects_tampered_roster_blob() {
    let ids = ["A", "B", "C"];
    let opts = ClusterOptions::default();
    let mut cluster = Cluster::start(&ids, &[], ClusterOptions::default()).await;

    cluster.advance(1, 15, &ids).await;
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 2);

    // the checkpoint pins this hash on chain
    let checkpoint = cluster.bitcoin.tx(&txids[1]).await;
    let out1 = checkpoint.output[1].script_pubkey.to_bytes();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&out1[2..]);

    // a store answering with bytes that do not hash to the key
    let bad_store = Arc::new(MemoryRosterStore::new());
    bad_store
        .put(&hash, b"not the roster that was signed")
        .await
        .unwrap();

    let config = cluster.config("A", "A", &opts);
    let err = bootstrap(
        &config,
        Arc::clone(&cluster.host) as Arc<dyn HostApi>,
        Arc::clone(&cluster.bitcoin) as Arc<dyn BitcoinApi>,
        bad_store as Arc<dyn RosterStore>,
        Arc::clone(&cluster.hubs["A"]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BootstrapError::RosterMismatch(_)));
}

/// Fee underflow is rejected before any transaction is built and the
/// cursor stays put.
#[tokio::test(flavor = "multi_thread")]
async fn fee_underflow_is_fatal_before_building() {
    let ids = ["A", "B", "C"];
    let mut cluster = Cluster::start(
        &ids,
        &[],
        ClusterOptions {
            // seed exactly the fee: input - fee would be zero
            funding_sats: Some(1_000),
            ..ClusterOptions::default()
        },
    )
    .await;

    let tip_before = cluster.cursor_of("A").await.previous_txid;

    cluster.advance(1, 14, &ids).await;
    let results = cluster.drive(15, &ids).await;
    for id in ids {
        let err = results[&id.to_string()].as_ref().unwrap_err();
        assert!(err.contains("cannot cover fee"), "unexpected error: {err}");
    }

    assert_eq!(cluster.bitcoin.create_raw_calls().await, 0);
    assert_eq!(cluster.bitcoin.txids().await.len(), 1, "no broadcast");
    assert_eq!(cluster.cursor_of("A").await.previous_txid, tip_before);
}

/// A non-taproot script at output 0 triggers the index-1 fallback.
#[tokio::test(flavor = "multi_thread")]
async fn non_taproot_output_zero_falls_back_to_index_one() {
    let ids = ["A", "B", "C"];
    let mut cluster = Cluster::start(
        &ids,
        &[],
        ClusterOptions {
            change_first: true,
            ..ClusterOptions::default()
        },
    )
    .await;

    let funding_txid = cluster.bitcoin.txids().await[0].clone();
    let funding = cluster.bitcoin.tx(&funding_txid).await;
    assert!(!funding.output[0].script_pubkey.is_p2tr());
    assert_eq!(taproot_vout(&funding), 1);

    cluster.advance(1, 15, &ids).await;
    let txids = cluster.bitcoin.txids().await;
    assert_eq!(txids.len(), 2);
    let checkpoint = cluster.bitcoin.tx(&txids[1]).await;
    assert_eq!(
        checkpoint.input[0].previous_output,
        OutPoint::new(Txid::from_str(&funding_txid).unwrap(), 1),
    );
}

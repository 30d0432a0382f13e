//! Bitcoin Core JSON-RPC client and the `BitcoinApi` seam.
//!
//! Standard JSON-RPC 1.0 framing against a trusted node whose wallet is
//! exclusive to this process. [`RpcClient`] is the production
//! implementation; everything above it talks to the [`BitcoinApi`] trait
//! so tests can swap in a deterministic chain.
//!
//! The anchor-chain walks (`scan_tipward`, `wallet_spender_of`) are
//! default methods layered on two primitives - the wallet transaction
//! list and verbose transaction lookup - so every implementation shares
//! the same walk logic.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::units;

/// Bitcoin RPC errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("bitcoin rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bitcoin rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("bitcoin rpc returned no result for {0}")]
    MissingResult(&'static str),

    #[error("malformed bitcoin rpc response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Transient errors are retried with backoff; the rest abort the
    /// current checkpoint attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

/// An unspent output as returned by `gettxout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub value_sats: u64,
    pub script_pubkey: Vec<u8>,
}

/// Reference to an output being spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevOut {
    pub txid: String,
    pub vout: u32,
}

/// Decoded transaction, enough to walk the anchor chain.
#[derive(Debug, Clone)]
pub struct TxInfo {
    pub txid: String,
    /// Outputs this transaction spends. Empty for coinbase.
    pub inputs: Vec<PrevOut>,
    /// scriptPubKey bytes per output, in output order.
    pub output_scripts: Vec<Vec<u8>>,
    /// Output values in satoshis, in output order.
    pub output_values: Vec<u64>,
}

/// Interface against the Bitcoin node.
#[async_trait]
pub trait BitcoinApi: Send + Sync {
    /// Liveness probe; startup fails fast when the node is unreachable.
    async fn ping(&self) -> Result<(), RpcError>;

    /// Import a taproot scriptPubKey into the wallet for watching.
    async fn import_taproot_script(&self, script: &[u8], rescan: bool) -> Result<(), RpcError>;

    /// Most recent wallet transaction paying `address`, if any.
    async fn wallet_txid_for_address(&self, address: &str) -> Result<Option<String>, RpcError>;

    /// The unspent output at `(txid, vout)`, if it exists and is unspent.
    async fn tx_out(&self, txid: &str, vout: u32) -> Result<Option<Utxo>, RpcError>;

    /// Build the raw checkpoint transaction: one input, the taproot
    /// output, then an `OP_RETURN` carrying `op_return`.
    async fn create_raw_transaction(
        &self,
        prev: &PrevOut,
        dest_address: &str,
        value_sats: u64,
        op_return: &[u8],
    ) -> Result<String, RpcError>;

    /// Broadcast a signed transaction; returns its txid.
    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError>;

    /// Pay `value_sats` from the wallet to `address` (anchor seeding).
    async fn send_to_address(&self, address: &str, value_sats: u64) -> Result<String, RpcError>;

    /// Trusted wallet balance in satoshis.
    async fn wallet_balance(&self) -> Result<u64, RpcError>;

    /// Wallet-known txids, newest first.
    async fn wallet_transactions(&self) -> Result<Vec<String>, RpcError>;

    /// Verbose transaction lookup.
    async fn raw_transaction(&self, txid: &str) -> Result<TxInfo, RpcError>;

    /// Walk wallet transactions newest-first and return the first whose
    /// output 0 carries exactly `script`.
    async fn scan_tipward(&self, script: &[u8]) -> Result<Option<String>, RpcError> {
        for txid in self.wallet_transactions().await? {
            let tx = self.raw_transaction(&txid).await?;
            if tx.output_scripts.first().map(Vec::as_slice) == Some(script) {
                return Ok(Some(txid));
            }
        }
        Ok(None)
    }

    /// Find the wallet transaction spending any output of `txid`.
    async fn wallet_spender_of(&self, txid: &str) -> Result<Option<String>, RpcError> {
        for candidate in self.wallet_transactions().await? {
            if candidate == txid {
                continue;
            }
            let tx = self.raw_transaction(&candidate).await?;
            if tx.inputs.iter().any(|input| input.txid == txid) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// Production JSON-RPC client.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
}

impl RpcClient {
    pub fn new(url: &str, user: Option<String>, pass: Option<String>) -> Self {
        let auth = user.map(|u| (u, pass.unwrap_or_default()));
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            auth,
        }
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "checkpointer",
            "method": method,
            "params": params,
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }

        let mut response: Value = request.send().await?.json().await?;

        let error = response.get("error").cloned().unwrap_or(Value::Null);
        if !error.is_null() {
            return Err(RpcError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }

        match response.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(RpcError::MissingResult(method)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListTransactionsEntry {
    txid: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseVin {
    txid: Option<String>,
    vout: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct VerboseScriptPubKey {
    hex: String,
}

#[derive(Debug, Deserialize)]
struct VerboseVout {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: VerboseScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct VerboseTransaction {
    txid: String,
    vin: Vec<VerboseVin>,
    vout: Vec<VerboseVout>,
}

fn parse_utxo(result: &Value) -> Result<Utxo, RpcError> {
    let value_btc = result
        .get("value")
        .and_then(Value::as_f64)
        .ok_or_else(|| RpcError::Malformed("gettxout without value".into()))?;
    let script_hex = result
        .get("scriptPubKey")
        .and_then(|s| s.get("hex"))
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Malformed("gettxout without scriptPubKey".into()))?;
    Ok(Utxo {
        value_sats: units::btc_to_sats(value_btc),
        script_pubkey: hex::decode(script_hex).map_err(|e| RpcError::Malformed(e.to_string()))?,
    })
}

fn parse_tx_info(result: Value) -> Result<TxInfo, RpcError> {
    let tx: VerboseTransaction =
        serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))?;

    let inputs = tx
        .vin
        .into_iter()
        .filter_map(|vin| match (vin.txid, vin.vout) {
            (Some(txid), Some(vout)) => Some(PrevOut { txid, vout }),
            _ => None, // coinbase
        })
        .collect();

    let mut output_scripts = Vec::new();
    let mut output_values = Vec::new();
    for vout in tx.vout {
        output_scripts.push(
            hex::decode(&vout.script_pub_key.hex)
                .map_err(|e| RpcError::Malformed(e.to_string()))?,
        );
        output_values.push(units::btc_to_sats(vout.value));
    }

    Ok(TxInfo {
        txid: tx.txid,
        inputs,
        output_scripts,
        output_values,
    })
}

#[async_trait]
impl BitcoinApi for RpcClient {
    async fn ping(&self) -> Result<(), RpcError> {
        self.call("ping", json!([])).await.map(|_| ())
    }

    async fn import_taproot_script(&self, script: &[u8], rescan: bool) -> Result<(), RpcError> {
        self.call(
            "importaddress",
            json!([hex::encode(script), "", rescan]),
        )
        .await
        .map(|_| ())
    }

    async fn wallet_txid_for_address(&self, address: &str) -> Result<Option<String>, RpcError> {
        let result = self
            .call("listtransactions", json!(["*", 1000, 0, true]))
            .await?;
        let entries: Vec<ListTransactionsEntry> =
            serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))?;

        // listtransactions is oldest-first; walk backwards for the tip
        for entry in entries.iter().rev() {
            if entry.address.as_deref() == Some(address) {
                if let Some(txid) = &entry.txid {
                    return Ok(Some(txid.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn tx_out(&self, txid: &str, vout: u32) -> Result<Option<Utxo>, RpcError> {
        let result = self.call("gettxout", json!([txid, vout])).await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_utxo(&result).map(Some)
    }

    async fn create_raw_transaction(
        &self,
        prev: &PrevOut,
        dest_address: &str,
        value_sats: u64,
        op_return: &[u8],
    ) -> Result<String, RpcError> {
        let inputs = json!([{
            "txid": prev.txid,
            "vout": prev.vout,
            "sequence": 4294967295u32,
        }]);
        let outputs = json!([
            { dest_address: units::format_btc(value_sats) },
            { "data": hex::encode(op_return) },
        ]);

        let result = self
            .call("createrawtransaction", json!([inputs, outputs]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("createrawtransaction returned non-string".into()))
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
        let result = self.call("sendrawtransaction", json!([tx_hex])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("sendrawtransaction returned non-string".into()))
    }

    async fn send_to_address(&self, address: &str, value_sats: u64) -> Result<String, RpcError> {
        let result = self
            .call(
                "sendtoaddress",
                json!([address, units::format_btc(value_sats)]),
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("sendtoaddress returned non-string".into()))
    }

    async fn wallet_balance(&self) -> Result<u64, RpcError> {
        let result = self.call("getbalances", json!([])).await?;
        let trusted = result
            .get("mine")
            .and_then(|m| m.get("trusted"))
            .and_then(Value::as_f64)
            .ok_or_else(|| RpcError::Malformed("getbalances without mine.trusted".into()))?;
        Ok(units::btc_to_sats(trusted))
    }

    async fn wallet_transactions(&self) -> Result<Vec<String>, RpcError> {
        let result = self
            .call("listtransactions", json!(["*", 1000, 0, true]))
            .await?;
        let entries: Vec<ListTransactionsEntry> =
            serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))?;

        let mut txids = Vec::new();
        for entry in entries.iter().rev() {
            if let Some(txid) = &entry.txid {
                if !txids.contains(txid) {
                    txids.push(txid.clone());
                }
            }
        }
        Ok(txids)
    }

    async fn raw_transaction(&self, txid: &str) -> Result<TxInfo, RpcError> {
        let result = self.call("getrawtransaction", json!([txid, true])).await?;
        parse_tx_info(result)
    }
}

//! Environment-based configuration.
//!
//! All knobs come from `CHECKPOINT_*` environment variables; the
//! resulting [`Config`] value is passed explicitly into constructors, so
//! nothing reads the environment after startup.
//!
//! # Environment Variables
//!
//! - `CHECKPOINT_NODE_ID` - this node's participant identifier (required)
//! - `CHECKPOINT_NETWORK` - "mainnet" or "regtest" (default: "regtest")
//! - `CHECKPOINT_BITCOIN_RPC` - Bitcoin Core JSON-RPC endpoint (required)
//! - `CHECKPOINT_BITCOIN_RPC_USER` / `CHECKPOINT_BITCOIN_RPC_PASS` - RPC auth
//! - `CHECKPOINT_FEE_BTC` - static fee policy in BTC (default: 0.00001)
//! - `CHECKPOINT_PERIOD` - checkpoint cadence in subnet epochs (default: 15)
//! - `CHECKPOINT_LEADER` - participant that publishes new group keys and
//!   seeds the first anchor UTXO (required)
//! - `CHECKPOINT_SHARE_PATH` - path to `share.toml` (required)
//! - `CHECKPOINT_ROSTER_STORE` - base URL of the roster blob store
//! - `CHECKPOINT_FUNDING_BTC` - fixed seeding amount; wallet balance minus
//!   fee when unset
//! - `CHECKPOINT_ROUND_TIMEOUT_SECS` - FROST round deadline (default: 60)
//! - `CHECKPOINT_LOG_LEVEL` - log level (default: "info")

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::taproot::NetworkParams;
use crate::units;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Parent-chain network. Changes the bech32 HRP and the wallet
/// import-rescan policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(ConfigError::InvalidValue(
                "CHECKPOINT_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    pub fn params(&self) -> NetworkParams {
        match self {
            Network::Mainnet => NetworkParams::mainnet(),
            Network::Regtest => NetworkParams::regtest(),
        }
    }
}

/// Main configuration struct.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's participant identifier.
    pub node_id: String,

    /// Parent-chain network.
    pub network: Network,

    /// Bitcoin Core JSON-RPC endpoint.
    pub bitcoin_rpc_url: String,

    /// Bitcoin RPC basic-auth credentials.
    pub bitcoin_rpc_user: Option<String>,
    pub bitcoin_rpc_pass: Option<String>,

    /// Static checkpoint fee in satoshis.
    pub fee_sats: u64,

    /// Checkpoint cadence in subnet epochs.
    pub checkpoint_period: u64,

    /// Participant that publishes new group keys and seeds the chain.
    pub leader: String,

    /// Path to this node's `share.toml`.
    pub share_path: PathBuf,

    /// Base URL of the roster blob store.
    pub roster_store_url: Option<String>,

    /// Fixed seeding amount in satoshis. Wallet balance minus fee when
    /// unset.
    pub funding_sats: Option<u64>,

    /// FROST round deadline.
    pub round_timeout: Duration,

    /// Log level.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = require("CHECKPOINT_NODE_ID")?;

        let network: Network = env::var("CHECKPOINT_NETWORK")
            .unwrap_or_else(|_| "regtest".to_string())
            .parse()?;

        let bitcoin_rpc_url = require("CHECKPOINT_BITCOIN_RPC")?;
        let bitcoin_rpc_user = env::var("CHECKPOINT_BITCOIN_RPC_USER").ok();
        let bitcoin_rpc_pass = env::var("CHECKPOINT_BITCOIN_RPC_PASS").ok();

        let fee_btc = parse_or("CHECKPOINT_FEE_BTC", 0.00001f64)?;
        if fee_btc <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "CHECKPOINT_FEE_BTC".to_string(),
                "fee must be positive".to_string(),
            ));
        }

        let checkpoint_period: u64 = parse_or("CHECKPOINT_PERIOD", 15)?;
        if checkpoint_period == 0 {
            return Err(ConfigError::InvalidValue(
                "CHECKPOINT_PERIOD".to_string(),
                "period must be positive".to_string(),
            ));
        }

        let leader = require("CHECKPOINT_LEADER")?;
        let share_path = PathBuf::from(require("CHECKPOINT_SHARE_PATH")?);
        let roster_store_url = env::var("CHECKPOINT_ROSTER_STORE").ok();

        let funding_sats = match env::var("CHECKPOINT_FUNDING_BTC") {
            Ok(v) => {
                let btc: f64 = v.parse().map_err(|_| {
                    ConfigError::InvalidValue(
                        "CHECKPOINT_FUNDING_BTC".to_string(),
                        "must be a BTC amount".to_string(),
                    )
                })?;
                Some(units::btc_to_sats(btc))
            }
            Err(_) => None,
        };

        let round_timeout = Duration::from_secs(parse_or("CHECKPOINT_ROUND_TIMEOUT_SECS", 60)?);
        let log_level = env::var("CHECKPOINT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_id,
            network,
            bitcoin_rpc_url,
            bitcoin_rpc_user,
            bitcoin_rpc_pass,
            fee_sats: units::btc_to_sats(fee_btc),
            checkpoint_period,
            leader,
            share_path,
            roster_store_url,
            funding_sats,
            round_timeout,
            log_level,
        })
    }

    /// Whether this node is the configured leader.
    pub fn is_leader(&self) -> bool {
        self.node_id == self.leader
    }

    /// Address-encoding parameters for the configured network.
    pub fn network_params(&self) -> NetworkParams {
        self.network.params()
    }
}

fn require(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("cannot parse {:?}", v))
        }),
        Err(_) => Ok(default),
    }
}

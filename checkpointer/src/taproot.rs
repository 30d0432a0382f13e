//! BIP-340/341 taproot codec for checkpoint keys.
//!
//! A checkpoint key commits to the anchored tipset: the payload is hashed
//! into a single TapLeaf, that leaf is the merkle root of the TapTweak,
//! and the tweaked key locks the next checkpoint UTXO. This module owns
//! the tagged-hash arithmetic, address encoding, the BIP-341 key-spend
//! sighash and witness assembly. All network-dependent encoding goes
//! through an explicit [`NetworkParams`] value; there is no ambient
//! network state.
//!
//! Failures here are fatal to the current checkpoint attempt; the
//! coordinator resets to a clean recovery on the next epoch.

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{Address, Amount, ScriptBuf, Transaction, TxOut, Witness, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors for taproot operations.
#[derive(Debug, Error)]
pub enum TaprootError {
    #[error("invalid x-only public key")]
    InvalidKey,
    #[error("invalid scalar value for tweak")]
    InvalidScalar,
    #[error("failed to apply tweak to public key")]
    TweakFailed,
    #[error("spent output is not a taproot UTXO")]
    NotTaproot,
    #[error("unsupported sighash type {0:#04x}")]
    UnsupportedSighashType(u8),
    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("sighash computation failed: {0}")]
    Sighash(String),
}

/// Address-encoding parameters, threaded through all codec calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    /// Parent-chain network; determines the bech32m HRP (`bc` / `bcrt`).
    pub network: bitcoin::Network,
    /// Whether `importaddress` should rescan. Rescans are cheap on
    /// regtest and prohibitive on mainnet.
    pub rescan_on_import: bool,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        Self {
            network: bitcoin::Network::Bitcoin,
            rescan_on_import: false,
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: bitcoin::Network::Regtest,
            rescan_on_import: true,
        }
    }
}

/// BIP-340 tagged hash: `SHA256(SHA256(tag) || SHA256(tag) || data)`.
fn tagged_hash(tag: &str, chunks: &[&[u8]]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// TapLeaf commitment to a checkpoint payload:
/// `TaggedHash("TapLeaf", pubkey || payload)`.
///
/// This digest doubles as the merkle root fed to the FROST engine when
/// signing under the tweaked key.
pub fn commitment_root(pubkey: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    tagged_hash("TapLeaf", &[pubkey, payload])
}

/// Checkpoint tweak: `TaggedHash("TapTweak", pubkey || merkle_root)`.
pub fn tweak(pubkey: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let root = commitment_root(pubkey, payload);
    tagged_hash("TapTweak", &[pubkey, &root])
}

/// Parse an x-only public key.
pub fn parse_x_only(pubkey: &[u8; 32]) -> Result<XOnlyPublicKey, TaprootError> {
    XOnlyPublicKey::from_slice(pubkey).map_err(|_| TaprootError::InvalidKey)
}

/// Add `tweak * G` to an x-only key, with even-Y adjustment. Returns the
/// new x-only key.
pub fn tweak_pubkey(pubkey: &[u8; 32], tweak: &[u8; 32]) -> Result<[u8; 32], TaprootError> {
    let secp = Secp256k1::verification_only();
    let key = parse_x_only(pubkey)?;
    let scalar =
        secp256k1::Scalar::from_be_bytes(*tweak).map_err(|_| TaprootError::InvalidScalar)?;
    let (tweaked, _parity) = key
        .add_tweak(&secp, &scalar)
        .map_err(|_| TaprootError::TweakFailed)?;
    Ok(tweaked.serialize())
}

/// Bech32m-encode a tweaked key as a witness-v1 address.
pub fn p2tr_address(pubkey: &[u8; 32], params: &NetworkParams) -> Result<String, TaprootError> {
    let key = parse_x_only(pubkey)?;
    let address = Address::p2tr_tweaked(
        TweakedPublicKey::dangerous_assume_tweaked(key),
        params.network,
    );
    Ok(address.to_string())
}

/// The scriptPubKey locking a checkpoint UTXO: `OP_1 <32-byte key>`.
pub fn taproot_script(pubkey: &[u8; 32]) -> Result<Vec<u8>, TaprootError> {
    let key = parse_x_only(pubkey)?;
    let script = ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(key));
    Ok(script.into_bytes())
}

/// Consensus-encode a spent output for [`key_spend_sighash`].
pub fn encode_prevout(value_sats: u64, script_pubkey: &[u8]) -> Vec<u8> {
    let txout = TxOut {
        value: Amount::from_sat(value_sats),
        script_pubkey: ScriptBuf::from(script_pubkey.to_vec()),
    };
    encode::serialize(&txout)
}

/// BIP-341 key-path sighash for the single-input checkpoint transaction.
///
/// `spent_utxo` is the consensus-encoded output being spent; `hash_type`
/// 0x00 is `SIGHASH_DEFAULT` and the only accepted value.
pub fn key_spend_sighash(
    tx_bytes: &[u8],
    spent_utxo: &[u8],
    hash_type: u8,
) -> Result<[u8; 32], TaprootError> {
    if hash_type != 0x00 {
        return Err(TaprootError::UnsupportedSighashType(hash_type));
    }

    let tx: Transaction = encode::deserialize(tx_bytes)
        .map_err(|e| TaprootError::MalformedTransaction(e.to_string()))?;
    if tx.input.is_empty() {
        return Err(TaprootError::NoInputs);
    }
    let prevout: TxOut = encode::deserialize(spent_utxo)
        .map_err(|e| TaprootError::MalformedTransaction(e.to_string()))?;
    if !prevout.script_pubkey.is_p2tr() {
        return Err(TaprootError::NotTaproot);
    }

    let mut cache = SighashCache::new(&tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(0, &Prevouts::All(&[prevout]), TapSighashType::Default)
        .map_err(|e| TaprootError::Sighash(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

/// Replace the first input's witness with the 64-byte Schnorr signature.
pub fn attach_witness(tx_hex: &str, signature: &[u8; 64]) -> Result<String, TaprootError> {
    let bytes =
        hex::decode(tx_hex).map_err(|e| TaprootError::MalformedTransaction(e.to_string()))?;
    let mut tx: Transaction = encode::deserialize(&bytes)
        .map_err(|e| TaprootError::MalformedTransaction(e.to_string()))?;
    if tx.input.is_empty() {
        return Err(TaprootError::NoInputs);
    }
    tx.input[0].witness = Witness::from_slice(&[signature.as_slice()]);
    Ok(encode::serialize_hex(&tx))
}

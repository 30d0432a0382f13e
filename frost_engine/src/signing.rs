//! Threshold sign-with-tweak driver.
//!
//! Produces a 64-byte BIP-340 Schnorr signature under the group key
//! tweaked by a BIP-341 merkle root, so the signature verifies against
//! the checkpoint-tweaked taproot output key. Two broadcast rounds:
//! nonce commitments, then signature shares; every participant
//! aggregates locally and verifies the result before returning it, so an
//! invalid signature can never reach the broadcast path.
//!
//! The session id is the message digest itself: all signers of one
//! checkpoint compute the same sighash, and signers of different
//! checkpoints can never collide.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use frost_secp256k1_tr as frost;
use frost::keys::Tweak;
use thiserror::Error;

use crate::session::{RoundError, SessionHub};
use crate::share::{identifier, ShareError, TaprootShare};

/// Signing errors. Every variant aborts the round without side effects.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("this node is not part of the signing set")]
    NotInSigningSet,
    #[error("signer {0} holds no verification share")]
    UnknownSigner(String),
    #[error("{got} signers below threshold {required}")]
    BelowThreshold { required: u16, got: usize },
    #[error("aggregated signature failed verification: {0}")]
    Verification(String),
    #[error("FROST error: {0}")]
    Frost(String),
    #[error(transparent)]
    Round(#[from] RoundError),
    #[error(transparent)]
    Share(#[from] ShareError),
}

fn frost_err(e: frost::Error) -> SignError {
    SignError::Frost(e.to_string())
}

/// Sign `message` with the group key tweaked by `merkle_root`.
///
/// `signers` is the set of participants expected to contribute; it must
/// contain this node, be a subset of the share's roster, and reach the
/// share's threshold. All signers run this concurrently and every one of
/// them returns the same aggregated signature.
pub async fn sign_with_tweak(
    hub: &Arc<SessionHub>,
    share: &TaprootShare,
    signers: &[String],
    message: &[u8; 32],
    merkle_root: &[u8; 32],
    round_timeout: Duration,
) -> Result<[u8; 64], SignError> {
    let mut signers: Vec<String> = signers.to_vec();
    signers.sort();
    signers.dedup();

    let self_id = hub.self_id().to_string();
    if !signers.iter().any(|id| id == &self_id) {
        return Err(SignError::NotInSigningSet);
    }
    let roster = share.participants();
    for signer in &signers {
        if !roster.contains(signer) {
            return Err(SignError::UnknownSigner(signer.clone()));
        }
    }
    if signers.len() < share.threshold() as usize {
        return Err(SignError::BelowThreshold {
            required: share.threshold(),
            got: signers.len(),
        });
    }

    tracing::info!(
        ?signers,
        message = %hex::encode(message),
        "starting threshold signing"
    );

    let mut session = hub.session(message.to_vec());
    let key_package = share.key_package()?;

    let mut idents: BTreeMap<String, frost::Identifier> = BTreeMap::new();
    for id in &signers {
        idents.insert(id.clone(), identifier(id)?);
    }

    // Round 1: nonce commitments.
    let (nonces, commitments) =
        frost::round1::commit(key_package.signing_share(), &mut rand::thread_rng());
    session
        .broadcast(commitments.serialize().map_err(frost_err)?)
        .await?;

    let inbound = session.collect_round(&signers, round_timeout).await?;
    let mut commitment_map: BTreeMap<frost::Identifier, frost::round1::SigningCommitments> =
        BTreeMap::new();
    commitment_map.insert(idents[&self_id], commitments);
    for (sender, payload) in &inbound {
        let ident = *idents
            .get(sender)
            .ok_or_else(|| SignError::UnknownSigner(sender.clone()))?;
        let commitment =
            frost::round1::SigningCommitments::deserialize(payload).map_err(frost_err)?;
        commitment_map.insert(ident, commitment);
    }

    let signing_package = frost::SigningPackage::new(commitment_map, message);

    // Round 2: signature shares, under the tweaked key.
    let signature_share = frost::round2::sign_with_tweak(
        &signing_package,
        &nonces,
        &key_package,
        Some(merkle_root.as_slice()),
    )
    .map_err(frost_err)?;
    session.broadcast(signature_share.serialize()).await?;

    let inbound = session.collect_round(&signers, round_timeout).await?;
    let mut share_map: BTreeMap<frost::Identifier, frost::round2::SignatureShare> =
        BTreeMap::new();
    share_map.insert(idents[&self_id], signature_share);
    for (sender, payload) in &inbound {
        let ident = *idents
            .get(sender)
            .ok_or_else(|| SignError::UnknownSigner(sender.clone()))?;
        let sig_share =
            frost::round2::SignatureShare::deserialize(payload).map_err(frost_err)?;
        share_map.insert(ident, sig_share);
    }

    // Everyone aggregates; the transaction is identical everywhere.
    let public_key_package = share.public_key_package()?;
    let signature = frost::aggregate_with_tweak(
        &signing_package,
        &share_map,
        &public_key_package,
        Some(merkle_root.as_slice()),
    )
    .map_err(frost_err)?;

    // Verify against the tweaked group key before anything leaves this
    // node; a signature that fails here must never be broadcast.
    let tweaked = public_key_package.tweak(Some(merkle_root.as_slice()));
    tweaked
        .verifying_key()
        .verify(message, &signature)
        .map_err(|e| SignError::Verification(e.to_string()))?;

    let bytes = signature.serialize().map_err(frost_err)?;
    let mut out = [0u8; 64];
    if bytes.len() != 64 {
        return Err(SignError::Frost(format!(
            "unexpected signature length {}",
            bytes.len()
        )));
    }
    out.copy_from_slice(&bytes);

    tracing::info!(signature = %hex::encode(out), "threshold signing complete");
    Ok(out)
}

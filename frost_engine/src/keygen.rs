//! Taproot DKG driver.
//!
//! Runs the trustless three-part FROST DKG over the shared topic. The
//! roster is lexicographically sorted, the threshold is `n / 2 + 1`, and
//! the session id is the concatenation of the sorted participant ids, so
//! every honest participant lands in the same session without any prior
//! coordination. The resulting group key is valid as a BIP-340 x-only
//! point (odd-Y outputs are negated by the ciphersuite).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use frost_secp256k1_tr as frost;
use thiserror::Error;

use crate::session::{RoundError, SessionHub};
use crate::share::{identifier, ShareError, TaprootShare};

/// Keygen errors. A failed round leaves the previous share untouched.
#[derive(Debug, Error)]
pub enum KeygenError {
    #[error("roster of {0} participants is below the threshold minimum of 2")]
    TooFewParticipants(usize),
    #[error("this node is not part of the keygen roster")]
    NotInRoster,
    #[error("message from unknown participant {0}")]
    UnknownSender(String),
    #[error("FROST error: {0}")]
    Frost(String),
    #[error(transparent)]
    Round(#[from] RoundError),
    #[error(transparent)]
    Share(#[from] ShareError),
}

fn frost_err(e: frost::Error) -> KeygenError {
    KeygenError::Frost(e.to_string())
}

/// Canonical roster: lexicographically sorted, deduplicated.
pub fn canonical_roster(participants: &[String]) -> Vec<String> {
    let mut roster: Vec<String> = participants.to_vec();
    roster.sort();
    roster.dedup();
    roster
}

/// Session id for a keygen round: the sorted ids, concatenated.
pub fn keygen_session_id(roster: &[String]) -> Vec<u8> {
    roster.iter().flat_map(|id| id.bytes()).collect()
}

/// Run a DKG round with `participants` and return this node's share.
///
/// Aborts (with state untouched) if any participant misses a round
/// deadline or sends malformed material; the caller retries on a later
/// epoch.
pub async fn keygen(
    hub: &Arc<SessionHub>,
    participants: &[String],
    round_timeout: Duration,
) -> Result<TaprootShare, KeygenError> {
    let roster = canonical_roster(participants);
    let n = roster.len();
    if n < 2 {
        return Err(KeygenError::TooFewParticipants(n));
    }
    let self_id = hub.self_id().to_string();
    if !roster.iter().any(|id| id == &self_id) {
        return Err(KeygenError::NotInRoster);
    }
    let threshold = (n / 2 + 1) as u16;

    tracing::info!(?roster, threshold, "starting taproot keygen");

    let mut session = hub.session(keygen_session_id(&roster));

    let mut idents: BTreeMap<String, frost::Identifier> = BTreeMap::new();
    for id in &roster {
        idents.insert(id.clone(), identifier(id)?);
    }
    let self_ident = idents[&self_id];

    // Part 1: commit to our secret polynomial, broadcast the commitment.
    let (round1_secret, round1_package) =
        frost::keys::dkg::part1(self_ident, n as u16, threshold, &mut rand::thread_rng())
            .map_err(frost_err)?;
    session
        .broadcast(round1_package.serialize().map_err(frost_err)?)
        .await?;

    let inbound = session.collect_round(&roster, round_timeout).await?;
    let mut round1_packages: BTreeMap<frost::Identifier, frost::keys::dkg::round1::Package> =
        BTreeMap::new();
    for (sender, payload) in &inbound {
        let ident = *idents
            .get(sender)
            .ok_or_else(|| KeygenError::UnknownSender(sender.clone()))?;
        let package =
            frost::keys::dkg::round1::Package::deserialize(payload).map_err(frost_err)?;
        round1_packages.insert(ident, package);
    }

    // Part 2: one share per peer, sent directly.
    let (round2_secret, round2_packages) =
        frost::keys::dkg::part2(round1_secret, &round1_packages).map_err(frost_err)?;
    for (ident, package) in round2_packages {
        let recipient = roster
            .iter()
            .find(|id| idents[*id] == ident)
            .ok_or_else(|| KeygenError::Frost("round 2 package for unknown identifier".into()))?;
        session
            .send_to(recipient, package.serialize().map_err(frost_err)?)
            .await?;
    }

    let inbound = session.collect_round(&roster, round_timeout).await?;
    let mut round2_received: BTreeMap<frost::Identifier, frost::keys::dkg::round2::Package> =
        BTreeMap::new();
    for (sender, payload) in &inbound {
        let ident = *idents
            .get(sender)
            .ok_or_else(|| KeygenError::UnknownSender(sender.clone()))?;
        let package =
            frost::keys::dkg::round2::Package::deserialize(payload).map_err(frost_err)?;
        round2_received.insert(ident, package);
    }

    // Part 3: derive the key share and the group key.
    let (key_package, public_key_package) =
        frost::keys::dkg::part3(&round2_secret, &round1_packages, &round2_received)
            .map_err(frost_err)?;

    let share = TaprootShare::from_dkg(&self_id, &roster, key_package, public_key_package)?;

    tracing::info!(
        group_key = %hex::encode(share.x_only()?),
        threshold,
        "taproot keygen complete"
    );

    Ok(share)
}

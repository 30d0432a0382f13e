//! Long-lived taproot key shares and their on-disk form.
//!
//! A [`TaprootShare`] is one participant's piece of a threshold taproot
//! key: the secret signing scalar, the x-only group public key, the
//! threshold, and every participant's public verification point. Shares
//! are produced by DKG and persisted as `share.toml` under
//! operator-controlled storage; a share is superseded only when a later
//! DKG round that includes this node completes and the rotation commits.
//!
//! Shares are normalized to an even-Y group key before they are stored or
//! used. BIP-340 encodes keys x-only, so the parity bit is not
//! representable on disk; keeping the even-Y form canonical makes the
//! file round-trip byte-stable and keeps the signing scalar consistent
//! with the key the verifier reconstructs.

use std::collections::BTreeMap;
use std::path::Path;

use frost_secp256k1_tr as frost;
use frost::keys::{EvenY, KeyPackage, PublicKeyPackage, SigningShare, VerifyingShare};
use frost::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Share errors. Malformed on-disk material is a startup failure.
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("share file parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("share file encode error: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        source: hex::FromHexError,
    },
    #[error("invalid {field} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("participant {0} missing from verification shares")]
    UnknownParticipant(String),
    #[error("FROST error: {0}")]
    Frost(String),
}

impl ShareError {
    pub(crate) fn frost(e: frost::Error) -> Self {
        ShareError::Frost(e.to_string())
    }
}

/// `share.toml` layout: `threshold`, `private_share` (hex scalar),
/// `public_key` (hex x-only point), and one `[verification_shares.<id>]`
/// table per participant.
#[derive(Debug, Serialize, Deserialize)]
struct ShareFile {
    threshold: u16,
    private_share: String,
    public_key: String,
    verification_shares: BTreeMap<String, VerificationShareEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VerificationShareEntry {
    share: String,
}

/// One participant's piece of a threshold taproot key.
#[derive(Clone)]
pub struct TaprootShare {
    /// This node's participant identifier.
    id: String,
    /// Minimum number of signers.
    threshold: u16,
    /// Secret signing scalar.
    signing_share: SigningShare,
    /// Group public key (even-Y).
    group_key: VerifyingKey,
    /// Participant id -> public verification point.
    verification_shares: BTreeMap<String, VerifyingShare>,
}

impl std::fmt::Debug for TaprootShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaprootShare")
            .field("id", &self.id)
            .field("threshold", &self.threshold)
            .field("signing_share", &"<redacted>")
            .field("group_key", &self.group_key)
            .field("verification_shares", &self.verification_shares)
            .finish()
    }
}

/// Derive the FROST identifier for a participant id string.
pub fn identifier(id: &str) -> Result<frost::Identifier, ShareError> {
    frost::Identifier::derive(id.as_bytes()).map_err(ShareError::frost)
}

impl TaprootShare {
    /// Assemble a share from a completed DKG round.
    ///
    /// `participants` must be the full sorted roster the DKG ran with;
    /// it maps the opaque FROST identifiers in `public_key_package` back
    /// to participant id strings.
    pub fn from_dkg(
        id: &str,
        participants: &[String],
        key_package: KeyPackage,
        public_key_package: PublicKeyPackage,
    ) -> Result<Self, ShareError> {
        let key_package = key_package.into_even_y(None);
        let public_key_package = public_key_package.into_even_y(None);

        let mut verification_shares = BTreeMap::new();
        for participant in participants {
            let ident = identifier(participant)?;
            let vshare = public_key_package
                .verifying_shares()
                .get(&ident)
                .ok_or_else(|| ShareError::UnknownParticipant(participant.clone()))?;
            verification_shares.insert(participant.clone(), vshare.clone());
        }

        Ok(Self {
            id: id.to_string(),
            threshold: *key_package.min_signers(),
            signing_share: key_package.signing_share().clone(),
            group_key: key_package.verifying_key().clone(),
            verification_shares,
        })
    }

    /// This node's participant identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Minimum number of signers.
    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    /// The full roster this share belongs to, lexicographically sorted.
    pub fn participants(&self) -> Vec<String> {
        self.verification_shares.keys().cloned().collect()
    }

    /// X-only encoding of the group public key.
    pub fn x_only(&self) -> Result<[u8; 32], ShareError> {
        let sec1 = self.group_key.serialize().map_err(ShareError::frost)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&sec1[1..33]);
        Ok(out)
    }

    /// Rebuild this node's FROST key package for signing.
    pub fn key_package(&self) -> Result<KeyPackage, ShareError> {
        let ident = identifier(&self.id)?;
        let vshare = self
            .verification_shares
            .get(&self.id)
            .ok_or_else(|| ShareError::UnknownParticipant(self.id.clone()))?;
        Ok(KeyPackage::new(
            ident,
            self.signing_share.clone(),
            vshare.clone(),
            self.group_key.clone(),
            self.threshold,
        ))
    }

    /// Rebuild the group's public key package for aggregation.
    pub fn public_key_package(&self) -> Result<PublicKeyPackage, ShareError> {
        let mut shares = BTreeMap::new();
        for (participant, vshare) in &self.verification_shares {
            shares.insert(identifier(participant)?, vshare.clone());
        }
        Ok(PublicKeyPackage::new(shares, self.group_key.clone()))
    }

    /// Load a share from `share.toml`, validating all key material.
    pub fn load(path: &Path, id: &str) -> Result<Self, ShareError> {
        let content = std::fs::read_to_string(path)?;
        let file: ShareFile = toml::from_str(&content)?;

        let scalar = decode_fixed::<32>("private_share", &file.private_share)?;
        let signing_share =
            SigningShare::deserialize(&scalar).map_err(ShareError::frost)?;

        let x_only = decode_fixed::<32>("public_key", &file.public_key)?;
        let mut sec1 = [0u8; 33];
        sec1[0] = 0x02; // even-Y is canonical for stored shares
        sec1[1..].copy_from_slice(&x_only);
        let group_key = VerifyingKey::deserialize(&sec1).map_err(ShareError::frost)?;

        let mut verification_shares = BTreeMap::new();
        for (participant, entry) in &file.verification_shares {
            let point = hex::decode(&entry.share).map_err(|source| ShareError::InvalidHex {
                field: "verification_shares",
                source,
            })?;
            let vshare =
                VerifyingShare::deserialize(&point).map_err(ShareError::frost)?;
            verification_shares.insert(participant.clone(), vshare);
        }

        if !verification_shares.contains_key(id) {
            return Err(ShareError::UnknownParticipant(id.to_string()));
        }

        tracing::info!(path = %path.display(), id, "loaded taproot share");

        Ok(Self {
            id: id.to_string(),
            threshold: file.threshold,
            signing_share,
            group_key,
            verification_shares,
        })
    }

    /// Persist the share as `share.toml`.
    pub fn save(&self, path: &Path) -> Result<(), ShareError> {
        let mut verification_shares = BTreeMap::new();
        for (participant, vshare) in &self.verification_shares {
            let point = vshare.serialize().map_err(ShareError::frost)?;
            verification_shares.insert(
                participant.clone(),
                VerificationShareEntry {
                    share: hex::encode(point),
                },
            );
        }

        let file = ShareFile {
            threshold: self.threshold,
            private_share: hex::encode(self.signing_share.serialize()),
            public_key: hex::encode(self.x_only()?),
            verification_shares,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(&file)?)?;

        tracing::info!(path = %path.display(), id = %self.id, "saved taproot share");
        Ok(())
    }
}

fn decode_fixed<const N: usize>(
    field: &'static str,
    value: &str,
) -> Result<[u8; N], ShareError> {
    let bytes = hex::decode(value).map_err(|source| ShareError::InvalidHex { field, source })?;
    if bytes.len() != N {
        return Err(ShareError::InvalidLength {
            field,
            expected: N,
            got: bytes.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

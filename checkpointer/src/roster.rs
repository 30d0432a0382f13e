//! The authoritative signer roster and its content-addressed blob.
//!
//! A roster is the ordered set of participants behind one checkpoint.
//! The published blob is UTF-8: first line the lowercase-hex checkpoint
//! payload, then one participant id per line, newline-terminated. Its
//! SHA-256 digest is both the storage key and the 32-byte `OP_RETURN`
//! commitment on the checkpoint transaction, so the chain pins the exact
//! roster that signed.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Roster blob errors.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("roster blob is not utf-8")]
    NotUtf8,
    #[error("roster blob is empty")]
    Empty,
    #[error("invalid payload hex: {0}")]
    InvalidPayload(hex::FromHexError),
}

/// Ordered participant roster, canonicalized by lexicographic sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    members: Vec<String>,
}

impl Roster {
    /// Canonicalize a member list: sorted, deduplicated.
    pub fn new(members: impl IntoIterator<Item = String>) -> Self {
        let mut members: Vec<String> = members.into_iter().collect();
        members.sort();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m == id)
    }

    /// Serialize with the checkpoint payload this roster signs for.
    pub fn serialize(&self, payload: &[u8]) -> Vec<u8> {
        let mut blob = hex::encode(payload);
        blob.push('\n');
        for member in &self.members {
            blob.push_str(member);
            blob.push('\n');
        }
        blob.into_bytes()
    }

    /// Parse a blob back into its payload and roster.
    pub fn parse(blob: &[u8]) -> Result<(Vec<u8>, Roster), RosterError> {
        let text = std::str::from_utf8(blob).map_err(|_| RosterError::NotUtf8)?;
        let mut lines = text.lines();
        let payload_hex = lines.next().ok_or(RosterError::Empty)?;
        let payload = hex::decode(payload_hex).map_err(RosterError::InvalidPayload)?;
        let members: Vec<String> = lines
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok((payload, Roster::new(members)))
    }

    /// Content address of a serialized blob.
    pub fn content_hash(blob: &[u8]) -> [u8; 32] {
        Sha256::digest(blob).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_canonicalized() {
        let roster = Roster::new(["carol", "alice", "bob", "alice"].map(String::from));
        assert_eq!(roster.members(), ["alice", "bob", "carol"]);
    }

    #[test]
    fn blob_layout() {
        let roster = Roster::new(["B", "A", "C"].map(String::from));
        let blob = roster.serialize(&[0xde, 0xad]);
        assert_eq!(blob, b"dead\nA\nB\nC\n");
    }

    #[test]
    fn parse_serialize_round_trip() {
        let roster = Roster::new(["alice", "bob", "carol"].map(String::from));
        let payload = vec![1u8, 2, 3, 4];
        let blob = roster.serialize(&payload);

        let (parsed_payload, parsed) = Roster::parse(&blob).unwrap();
        assert_eq!(parsed_payload, payload);
        assert_eq!(parsed, roster);

        // hash is stable across the round trip
        assert_eq!(
            Roster::content_hash(&blob),
            Roster::content_hash(&parsed.serialize(&parsed_payload))
        );
    }

    #[test]
    fn content_hash_matches_scenario_fixture() {
        // SHA-256 of hex(payload) || "\nA\nB\nC\n"
        let roster = Roster::new(["A", "B", "C"].map(String::from));
        let payload = b"genesis";
        let blob = roster.serialize(payload);

        let mut expected = hex::encode(payload).into_bytes();
        expected.extend_from_slice(b"\nA\nB\nC\n");
        assert_eq!(blob, expected);
        assert_eq!(Roster::content_hash(&blob), {
            let digest: [u8; 32] = Sha256::digest(&expected).into();
            digest
        });
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(Roster::parse(&[0xff, 0xfe]), Err(RosterError::NotUtf8)));
        assert!(matches!(
            Roster::parse(b"zz\nA\n"),
            Err(RosterError::InvalidPayload(_))
        ));
    }
}

//! FROST threshold cryptography for taproot checkpoint anchoring.
//!
//! This crate drives the two FROST sub-protocols a checkpointing node
//! needs, both speaking BIP-340/341 taproot semantics over secp256k1:
//!
//! - **Taproot keygen**: a trustless three-part DKG producing an x-only
//!   group public key and one [`TaprootShare`] per participant.
//! - **Taproot sign with tweak**: two-round threshold Schnorr signing
//!   under the group key tweaked by a BIP-341 merkle root, so the
//!   signature verifies against a checkpoint-tweaked output key.
//!
//! Participants coordinate over a single long-lived pubsub topic; the
//! [`network`] module defines the transport seam and the wire envelope,
//! and [`session`] routes inbound messages to the one live round.
//!
//! # Coordination model
//!
//! Every round is all-to-all: each participant broadcasts its protocol
//! message, collects exactly one message per remote peer (filtered by
//! session id, deduplicated by sender), and advances. A peer that stays
//! silent past the round deadline aborts the whole round; the caller
//! retries on its next epoch.

pub mod keygen;
pub mod network;
pub mod session;
pub mod share;
pub mod signing;

pub use keygen::{keygen, KeygenError};
pub use network::{Envelope, MemoryPubsub, NetError, PubsubNet, INBOUND_BUFFER, KEYGEN_TOPIC};
pub use session::{FrostSession, RoundError, SessionHub};
pub use share::{ShareError, TaprootShare};
pub use signing::{sign_with_tweak, SignError};

//! Pubsub transport seam and the FROST wire envelope.
//!
//! All rounds of all sessions share one long-lived topic. Each message
//! is an [`Envelope`]: a session id, the sender, a broadcast flag and an
//! optional recipient, followed by the raw FROST protocol bytes. The
//! subscriber side tags messages by session id and hands them to the
//! matching live session (see [`crate::session`]).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Topic shared by all keygen and signing rounds.
pub const KEYGEN_TOPIC: &str = "keygen";

/// Minimum inbound queue depth per subscriber. Rounds are bursty: every
/// participant publishes at the same instant, so a shallow queue drops
/// messages under load.
pub const INBOUND_BUFFER: usize = 1000;

/// Transport errors.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
}

/// Broadcast transport carrying opaque payloads on named topics.
///
/// Implementations must deliver messages FIFO per publisher and buffer at
/// least [`INBOUND_BUFFER`] inbound messages per subscriber. Duplicate
/// delivery is tolerated by the round driver.
#[async_trait]
pub trait PubsubNet: Send + Sync {
    /// Publish `data` to every subscriber of `topic`, including the
    /// publisher itself.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError>;

    /// Subscribe to `topic`. Messages published after this call are
    /// delivered to the returned channel.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, NetError>;
}

/// One FROST protocol message addressed within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Session this message belongs to.
    pub session_id: Vec<u8>,
    /// Participant id of the sender.
    pub sender: String,
    /// True for round broadcasts; false for direct messages.
    pub is_broadcast: bool,
    /// Recipient participant id, empty on broadcasts.
    pub recipient: Option<String>,
    /// Raw FROST protocol bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn broadcast(session_id: &[u8], sender: &str, payload: Vec<u8>) -> Self {
        Self {
            session_id: session_id.to_vec(),
            sender: sender.to_string(),
            is_broadcast: true,
            recipient: None,
            payload,
        }
    }

    pub fn direct(session_id: &[u8], sender: &str, recipient: &str, payload: Vec<u8>) -> Self {
        Self {
            session_id: session_id.to_vec(),
            sender: sender.to_string(),
            is_broadcast: false,
            recipient: Some(recipient.to_string()),
            payload,
        }
    }

    /// Wire layout: for each of session id, sender and recipient a u16
    /// big-endian length followed by the bytes (recipient empty on
    /// broadcasts), a one-byte broadcast flag between sender and
    /// recipient, then the payload to the end of the message.
    pub fn encode(&self) -> Vec<u8> {
        let recipient = self.recipient.as_deref().unwrap_or("");
        let mut out = Vec::with_capacity(
            7 + self.session_id.len() + self.sender.len() + recipient.len() + self.payload.len(),
        );
        out.extend_from_slice(&(self.session_id.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&(self.sender.len() as u16).to_be_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        out.push(self.is_broadcast as u8);
        out.extend_from_slice(&(recipient.len() as u16).to_be_bytes());
        out.extend_from_slice(recipient.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, NetError> {
        let mut cursor = 0usize;

        let session_id = take_field(data, &mut cursor)?.to_vec();
        let sender = std::str::from_utf8(take_field(data, &mut cursor)?)
            .map_err(|_| NetError::Malformed("sender is not utf-8"))?
            .to_string();

        let flag = *data
            .get(cursor)
            .ok_or(NetError::Malformed("missing broadcast flag"))?;
        cursor += 1;
        let is_broadcast = match flag {
            0 => false,
            1 => true,
            _ => return Err(NetError::Malformed("invalid broadcast flag")),
        };

        let recipient_bytes = take_field(data, &mut cursor)?;
        let recipient = if recipient_bytes.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(recipient_bytes)
                    .map_err(|_| NetError::Malformed("recipient is not utf-8"))?
                    .to_string(),
            )
        };

        Ok(Self {
            session_id,
            sender,
            is_broadcast,
            recipient,
            payload: data[cursor..].to_vec(),
        })
    }
}

fn take_field<'a>(data: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], NetError> {
    let end = *cursor + 2;
    let len_bytes: [u8; 2] = data
        .get(*cursor..end)
        .ok_or(NetError::Malformed("truncated length prefix"))?
        .try_into()
        .expect("slice has length 2");
    let len = u16::from_be_bytes(len_bytes) as usize;
    let field = data
        .get(end..end + len)
        .ok_or(NetError::Malformed("truncated field"))?;
    *cursor = end + len;
    Ok(field)
}

/// In-process pubsub hub for tests and single-process clusters.
///
/// Every subscriber of a topic receives every message published to it,
/// in publish order.
#[derive(Default)]
pub struct MemoryPubsub {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().expect("pubsub lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(INBOUND_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl PubsubNet for MemoryPubsub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        // A send error just means no subscriber yet; the round driver
        // treats missing messages as a timeout, not a transport fault.
        let _ = self.topic_sender(topic).send(data);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, NetError> {
        let mut rx = self.topic_sender(topic).subscribe();
        let (tx, out) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "pubsub subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}

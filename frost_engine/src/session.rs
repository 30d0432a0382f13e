//! Session routing and the round driver primitive.
//!
//! A [`SessionHub`] owns the node's single subscription to the shared
//! topic and fans inbound envelopes out to live sessions by session id.
//! Envelopes that arrive before their session registers are buffered and
//! replayed on registration, so a peer that starts a round slightly
//! earlier than us does not lose its first message.
//!
//! A [`FrostSession`] is one live round of keygen or signing: it sends
//! this node's outbound messages and collects exactly one inbound
//! message per remote participant per round, FIFO per sender, bounded by
//! a deadline. Message order across senders within a round is
//! irrelevant; order across rounds is preserved by the per-sender FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::network::{Envelope, NetError, PubsubNet, INBOUND_BUFFER, KEYGEN_TOPIC};

/// Round driver errors. Any of these aborts the whole round.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("round timed out waiting for {missing:?}")]
    Timeout { missing: Vec<String> },
    #[error("session channel closed")]
    Closed,
    #[error(transparent)]
    Net(#[from] NetError),
}

struct Router {
    sessions: HashMap<Vec<u8>, mpsc::Sender<Envelope>>,
    /// Envelopes for sessions that have not registered yet.
    pending: VecDeque<Envelope>,
}

/// Routes inbound topic messages to live sessions.
pub struct SessionHub {
    self_id: String,
    net: Arc<dyn PubsubNet>,
    router: Arc<Mutex<Router>>,
}

impl SessionHub {
    /// Subscribe to the shared topic and start routing.
    pub async fn start(net: Arc<dyn PubsubNet>, self_id: &str) -> Result<Arc<Self>, NetError> {
        let mut inbound = net.subscribe(KEYGEN_TOPIC).await?;
        let router = Arc::new(Mutex::new(Router {
            sessions: HashMap::new(),
            pending: VecDeque::new(),
        }));

        let pump_router = Arc::clone(&router);
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                let envelope = match Envelope::decode(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed pubsub message");
                        continue;
                    }
                };
                let mut router = pump_router.lock().expect("router lock poisoned");
                match router.sessions.get(&envelope.session_id) {
                    Some(tx) => {
                        if tx.try_send(envelope).is_err() {
                            tracing::warn!("session queue full, dropping message");
                        }
                    }
                    None => {
                        if router.pending.len() >= INBOUND_BUFFER {
                            router.pending.pop_front();
                        }
                        router.pending.push_back(envelope);
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            self_id: self_id.to_string(),
            net,
            router,
        }))
    }

    /// This node's participant id.
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Open a session for one protocol round. Buffered early arrivals
    /// for this session id are replayed into it.
    pub fn session(self: &Arc<Self>, session_id: Vec<u8>) -> FrostSession {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        {
            let mut router = self.router.lock().expect("router lock poisoned");
            let mut remaining = VecDeque::new();
            while let Some(envelope) = router.pending.pop_front() {
                if envelope.session_id == session_id {
                    let _ = tx.try_send(envelope);
                } else {
                    remaining.push_back(envelope);
                }
            }
            router.pending = remaining;
            router.sessions.insert(session_id.clone(), tx);
        }
        FrostSession {
            hub: Arc::clone(self),
            id: session_id,
            rx,
            queues: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    fn deregister(&self, session_id: &[u8]) {
        let mut router = self.router.lock().expect("router lock poisoned");
        router.sessions.remove(session_id);
    }
}

/// One live keygen or signing round.
pub struct FrostSession {
    hub: Arc<SessionHub>,
    id: Vec<u8>,
    rx: mpsc::Receiver<Envelope>,
    /// Per-sender FIFO of payloads not yet consumed by a round.
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    /// Last payload accepted per sender, to collapse duplicate delivery.
    last_seen: HashMap<String, Vec<u8>>,
}

impl FrostSession {
    /// Session identifier.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Broadcast a protocol message to all participants.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<(), RoundError> {
        let envelope = Envelope::broadcast(&self.id, self.hub.self_id(), payload);
        self.hub
            .net
            .publish(KEYGEN_TOPIC, envelope.encode())
            .await?;
        Ok(())
    }

    /// Send a protocol message to a single participant.
    pub async fn send_to(&self, recipient: &str, payload: Vec<u8>) -> Result<(), RoundError> {
        let envelope = Envelope::direct(&self.id, self.hub.self_id(), recipient, payload);
        self.hub
            .net
            .publish(KEYGEN_TOPIC, envelope.encode())
            .await?;
        Ok(())
    }

    /// Collect exactly one message from each of `senders` (this node
    /// excluded), waiting at most `deadline`.
    pub async fn collect_round(
        &mut self,
        senders: &[String],
        deadline: Duration,
    ) -> Result<HashMap<String, Vec<u8>>, RoundError> {
        let until = Instant::now() + deadline;
        let expected: Vec<&String> = senders
            .iter()
            .filter(|s| s.as_str() != self.hub.self_id())
            .collect();

        let mut collected: HashMap<String, Vec<u8>> = HashMap::new();
        loop {
            for sender in &expected {
                if collected.contains_key(sender.as_str()) {
                    continue;
                }
                if let Some(queue) = self.queues.get_mut(sender.as_str()) {
                    if let Some(payload) = queue.pop_front() {
                        collected.insert((*sender).clone(), payload);
                    }
                }
            }
            if collected.len() == expected.len() {
                return Ok(collected);
            }

            let envelope = match timeout_at(until, self.rx.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Err(RoundError::Closed),
                Err(_) => {
                    let missing = expected
                        .iter()
                        .filter(|s| !collected.contains_key(s.as_str()))
                        .map(|s| (*s).clone())
                        .collect();
                    return Err(RoundError::Timeout { missing });
                }
            };
            self.accept(envelope);
        }
    }

    fn accept(&mut self, envelope: Envelope) {
        if envelope.sender == self.hub.self_id() {
            return;
        }
        if !envelope.is_broadcast
            && envelope.recipient.as_deref() != Some(self.hub.self_id())
        {
            return;
        }
        if self.last_seen.get(&envelope.sender) == Some(&envelope.payload) {
            return;
        }
        self.last_seen
            .insert(envelope.sender.clone(), envelope.payload.clone());
        self.queues
            .entry(envelope.sender)
            .or_default()
            .push_back(envelope.payload);
    }
}

impl Drop for FrostSession {
    fn drop(&mut self) {
        self.hub.deregister(&self.id);
    }
}

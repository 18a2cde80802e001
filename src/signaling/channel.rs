use crate::error::CallError;
use crate::signaling::message::SignalMessage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a room subscriber receives.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(SignalMessage),
    /// The transport to the relay is gone; nothing more will arrive.
    Disconnected,
}

/// Cloneable outbound half of a signaling channel.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalSender {
    pub fn new(tx: mpsc::UnboundedSender<SignalMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: SignalMessage) -> Result<(), CallError> {
        tracing::trace!(event = msg.event_name(), room_id = ?msg.room_id(), "Signal out");
        self.tx.send(msg).map_err(|_| CallError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Subscriber {
    room_id: String,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

type Subscribers = Arc<DashMap<u64, Subscriber>>;

/// Inbound messages of one room. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    room_id: String,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    subscribers: Subscribers,
}

impl Subscription {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
        tracing::debug!(room_id = self.room_id.as_str(), "Unsubscribed from room");
    }
}

/// Client side of the signaling relay.
///
/// A dispatcher task routes every inbound message to the subscribers of its
/// room. No buffering or reordering happens here: messages reach subscribers
/// in transport order, and messages for rooms nobody subscribed to are
/// dropped.
pub struct SignalingChannel {
    sender: SignalSender,
    subscribers: Subscribers,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Wraps a message-pair transport. When `inbound` closes, the channel
    /// counts as disconnected.
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<SignalMessage>,
        inbound: mpsc::UnboundedReceiver<SignalMessage>,
    ) -> Self {
        Self::with_tasks(outbound, inbound, Vec::new())
    }

    pub(crate) fn with_tasks(
        outbound: mpsc::UnboundedSender<SignalMessage>,
        mut inbound: mpsc::UnboundedReceiver<SignalMessage>,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let subscribers: Subscribers = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));

        let dispatcher = tokio::spawn({
            let subscribers = subscribers.clone();
            let connected = connected.clone();
            async move {
                while let Some(msg) = inbound.recv().await {
                    tracing::trace!(event = msg.event_name(), room_id = ?msg.room_id(), "Signal in");
                    match msg.room_id() {
                        Some(room_id) => {
                            for entry in subscribers.iter().filter(|s| s.room_id == room_id) {
                                let _ = entry.tx.send(ChannelEvent::Message(msg.clone()));
                            }
                        }
                        None => {
                            for entry in subscribers.iter() {
                                let _ = entry.tx.send(ChannelEvent::Message(msg.clone()));
                            }
                        }
                    }
                }

                tracing::warn!("Signaling transport closed");
                connected.store(false, Ordering::SeqCst);
                for entry in subscribers.iter() {
                    let _ = entry.tx.send(ChannelEvent::Disconnected);
                }
            }
        });
        tasks.push(dispatcher);

        Self {
            sender: SignalSender::new(outbound),
            subscribers,
            next_id: AtomicU64::new(1),
            connected,
            tasks,
        }
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, room_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(
            id,
            Subscriber {
                room_id: room_id.to_string(),
                tx: tx.clone(),
            },
        );
        // the dispatcher may already have run its disconnect broadcast
        if !self.is_connected() {
            let _ = tx.send(ChannelEvent::Disconnected);
        }
        tracing::debug!(room_id, "Subscribed to room");
        Subscription {
            id,
            room_id: room_id.to_string(),
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn join(&self, room_id: &str, user_id: &str) -> Result<(), CallError> {
        self.sender.send(SignalMessage::JoinCallRoom {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        })
    }

    pub fn leave(&self, room_id: &str) -> Result<(), CallError> {
        self.sender.send(SignalMessage::LeaveCallRoom {
            room_id: room_id.to_string(),
        })
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

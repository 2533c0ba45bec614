//! Message bus adapter with publish-subscribe over named channels.

use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one subscription within a channel's fan-out list.
///
/// Only ever compared and displayed; allocated from a process-wide
/// counter so dead subscriptions can be pruned by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle to a channel subscription delivering raw payloads.
pub struct BusSubscription {
    id: SubscriberId,
    channel: String,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl BusSubscription {
    fn new(id: SubscriberId, channel: String, receiver: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            id,
            channel,
            receiver,
        }
    }

    /// Get the subscription ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Get the channel this subscription reads from.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next payload.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    /// Try to receive a payload without blocking.
    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }
}

/// Abstract pub/sub seam over the message bus.
///
/// Any substrate with at-least-once delivery over named channels satisfies
/// this contract. Duplicate deliveries are tolerated upstream: the
/// correlation layer drops payloads whose correlation ID has no awaiter.
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Publish a raw payload to a channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to a channel, receiving every payload published after the
    /// subscription is established.
    async fn subscribe(&self, channel: &str) -> BusResult<BusSubscription>;
}

type ChannelMap = HashMap<String, Vec<(SubscriberId, mpsc::UnboundedSender<Vec<u8>>)>>;

/// In-process bus with per-channel fan-out.
///
/// Used by the test suites and by the self-contained local process mode;
/// a broker-backed adapter plugs in behind the same [`BusAdapter`] seam.
pub struct InMemoryBus {
    channels: Arc<RwLock<ChannelMap>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// Create a new in-memory bus.
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the number of active subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusAdapter for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()> {
        let mut failed = Vec::new();

        {
            let channels = self.channels.read();
            let Some(subscribers) = channels.get(channel) else {
                return Ok(());
            };
            for (id, sender) in subscribers {
                if sender.send(payload.clone()).is_err() {
                    failed.push(*id);
                }
            }
        }

        // Clean up subscribers whose receiving end is gone.
        if !failed.is_empty() {
            let mut channels = self.channels.write();
            if let Some(subscribers) = channels.get_mut(channel) {
                subscribers.retain(|(id, _)| !failed.contains(id));
            }
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BusResult<BusSubscription> {
        if channel.is_empty() {
            return Err(BusError::Publish {
                channel: channel.to_string(),
                reason: "channel name is empty".to_string(),
            });
        }

        let id = SubscriberId::next();
        let (tx, rx) = mpsc::unbounded_channel();

        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        Ok(BusSubscription::new(id, channel.to_string(), rx))
    }
}

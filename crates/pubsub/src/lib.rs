use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use shared::protocol::{BroadcastEvent, ChannelStatus};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One item delivered on a channel subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Event(BroadcastEvent),
    Status(ChannelStatus),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Releases the channel subscription when dropped.
pub struct SubscriptionGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("armed", &self.release.is_some())
            .finish()
    }
}

/// A live channel subscription: status changes and broadcasts arrive on
/// `signals` until `guard` is dropped.
#[derive(Debug)]
pub struct Subscription {
    pub guard: SubscriptionGuard,
    pub signals: mpsc::UnboundedReceiver<TransportSignal>,
}

impl Subscription {
    pub fn into_parts(self) -> (SubscriptionGuard, mpsc::UnboundedReceiver<TransportSignal>) {
        (self.guard, self.signals)
    }
}

#[async_trait]
pub trait ChannelSubscriber: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}

/// Fire-and-forget publishing. Success only means the event was handed to the
/// transport, not that any subscriber received it.
pub trait ChannelPublisher: Send + Sync {
    fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;
}

type Subscribers = HashMap<u64, mpsc::UnboundedSender<TransportSignal>>;

/// Channel broker for a single process. The server fans broadcasts out through
/// it and tests drive it directly to inject transport faults.
#[derive(Clone, Default)]
pub struct InProcessBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    channels: Mutex<HashMap<String, Subscribers>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    subscribe_calls: AtomicUsize,
}

impl BrokerInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, Subscribers>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, channel: &str, id: u64) {
        let mut channels = self.channels();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
        debug!(channel, subscription = id, "pubsub: subscription released");
    }
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, subscribe and publish both fail with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Pushes a status change to every current subscriber of `channel`.
    pub fn inject_status(&self, channel: &str, status: ChannelStatus) {
        self.fan_out(channel, TransportSignal::Status(status));
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels()
            .get(channel)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Number of subscribe attempts seen so far, including failed ones.
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    fn fan_out(&self, channel: &str, signal: TransportSignal) -> usize {
        let mut channels = self.inner.channels();
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|_, tx| tx.send(signal.clone()).is_ok());
        subscribers.len()
    }
}

#[async_trait]
impl ChannelSubscriber for InProcessBroker {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if channel.trim().is_empty() {
            return Err(TransportError::InvalidChannel(channel.to_string()));
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("broker offline".into()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportSignal::Status(ChannelStatus::Subscribed));
        self.inner
            .channels()
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
        debug!(channel, subscription = id, "pubsub: subscribed");

        let inner = Arc::clone(&self.inner);
        let owned_channel = channel.to_string();
        Ok(Subscription {
            guard: SubscriptionGuard::new(move || inner.release(&owned_channel, id)),
            signals: rx,
        })
    }
}

impl ChannelPublisher for InProcessBroker {
    fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            warn!(channel, event, "pubsub: publish while offline");
            return Err(TransportError::Unavailable("broker offline".into()));
        }
        let delivered = self.fan_out(
            channel,
            TransportSignal::Event(BroadcastEvent {
                channel: channel.to_string(),
                event: event.to_string(),
                payload,
            }),
        );
        debug!(channel, event, delivered, "pubsub: published");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

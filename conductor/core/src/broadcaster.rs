//! Broadcaster - Event Fan-out to Surfaces
//!
//! Delivers every supervisor event to all currently subscribed sinks:
//!
//! - Subscribe and unsubscribe at any time
//! - Publish to every live sink in registration order
//! - Drop sinks that have gone away without aborting delivery to the rest
//!
//! # Architecture
//!
//! ```text
//!                        Broadcaster
//!                 ┌──────────────────────────────────┐
//!                 │ Vec<Arc<Subscription>>           │
//!                 │   - wrapped in Arc<RwLock<>>     │
//!                 └───────────────┬──────────────────┘
//!                                 │
//!           ┌─────────────────────┼─────────────────────┐
//!           │                     │                     │
//!    ┌──────▼──────┐      ┌───────▼──────┐      ┌───────▼──────┐
//!    │ ChannelSink │      │  RemoteSink  │      │ CallbackSink │
//!    │  (console)  │      │ (WebSocket)  │      │   (tests)    │
//!    └─────────────┘      └──────────────┘      └──────────────┘
//! ```
//!
//! Nothing is buffered or replayed: a subscriber that joins after an event
//! was published never sees it, and delivery is at most once.
//!
//! # Thread Safety
//!
//! `publish` takes a snapshot of the set under the read lock and delivers
//! outside of it, so a sink may unsubscribe (even itself) while a publish is
//! in progress. Each subscription carries an `active` flag that
//! `unsubscribe` clears before removal; a publish that already holds the
//! snapshot skips inactive entries.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::AgentEvent;

/// Unique identifier for a subscription
///
/// Assigned on subscribe; stable for the lifetime of the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Create a new unique subscriber ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a subscriber ID from a raw value (for testing)
    #[cfg(test)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Why a sink could not accept an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The sink is gone for good; it will be removed from the set
    #[error("sink disconnected")]
    Disconnected,
    /// The sink is alive but cannot take this event right now; the event is
    /// dropped for this sink only
    #[error("sink buffer full")]
    Full,
}

/// Anything that can receive a published event
///
/// Implementations must not block: `deliver` is called from the
/// supervisor's reader tasks.
pub trait EventSink: Send + Sync {
    /// Accept one event
    fn deliver(&self, event: &AgentEvent) -> Result<(), SinkError>;

    /// Whether the sink can still receive events
    fn is_connected(&self) -> bool {
        true
    }
}

/// Sink backed by a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<AgentEvent>,
}

impl ChannelSink {
    /// Wrap an existing sender
    #[must_use]
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver that drains it
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &AgentEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Disconnected,
        })
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Sink backed by a closure
pub struct CallbackSink<F>
where
    F: Fn(&AgentEvent) -> Result<(), SinkError> + Send + Sync,
{
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: Fn(&AgentEvent) -> Result<(), SinkError> + Send + Sync,
{
    /// Wrap a fallible callback
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventSink for CallbackSink<F>
where
    F: Fn(&AgentEvent) -> Result<(), SinkError> + Send + Sync,
{
    fn deliver(&self, event: &AgentEvent) -> Result<(), SinkError> {
        (self.callback)(event)
    }
}

impl<F> fmt::Debug for CallbackSink<F>
where
    F: Fn(&AgentEvent) -> Result<(), SinkError> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

/// One entry in the subscriber set
struct Subscription {
    id: SubscriberId,
    label: String,
    sink: Box<dyn EventSink>,
    active: AtomicBool,
    subscribed_at: Instant,
}

/// Result of a publish
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Sinks that accepted the event
    pub delivered: usize,
    /// Sinks that were alive but full (event dropped for them)
    pub skipped: usize,
    /// Sinks found disconnected and removed
    pub failed_ids: Vec<SubscriberId>,
}

impl BroadcastResult {
    /// Check if every sink accepted the event
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.skipped == 0 && self.failed_ids.is_empty()
    }
}

/// Summary of one subscription, for status displays
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    /// Subscription identifier
    pub id: SubscriberId,
    /// Free-form label given at subscribe time
    pub label: String,
    /// Seconds since the subscription was made
    pub uptime_secs: u64,
}

/// Fan-out of supervisor events to a dynamic set of sinks
///
/// Cloning is cheap and clones share the same set.
#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<RwLock<Vec<Arc<Subscription>>>>,
}

impl Broadcaster {
    /// Create an empty broadcaster
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink; it receives every event published from now on
    pub fn subscribe(&self, sink: impl EventSink + 'static) -> SubscriberId {
        self.subscribe_labeled("anonymous", sink)
    }

    /// Register a sink with a label used in logs and summaries
    pub fn subscribe_labeled(
        &self,
        label: impl Into<String>,
        sink: impl EventSink + 'static,
    ) -> SubscriberId {
        let subscription = Arc::new(Subscription {
            id: SubscriberId::new(),
            label: label.into(),
            sink: Box::new(sink),
            active: AtomicBool::new(true),
            subscribed_at: Instant::now(),
        });
        let id = subscription.id;
        let label = subscription.label.clone();

        let mut inner = self.inner.write();
        inner.push(subscription);
        tracing::info!(
            subscriber_id = %id,
            label = %label,
            subscribers = inner.len(),
            "Subscriber added"
        );
        id
    }

    /// Remove a sink; it receives no further events
    ///
    /// Returns false if the ID was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.write();
        let Some(pos) = inner.iter().position(|s| s.id == id) else {
            return false;
        };
        let subscription = inner.remove(pos);
        subscription.active.store(false, Ordering::Release);
        tracing::info!(
            subscriber_id = %id,
            label = %subscription.label,
            subscribers = inner.len(),
            "Subscriber removed"
        );
        true
    }

    /// Deliver an event to every live sink, in registration order
    ///
    /// Disconnected sinks are removed; a full sink misses this event only.
    pub fn publish(&self, event: &AgentEvent) -> BroadcastResult {
        let snapshot: Vec<Arc<Subscription>> = self.inner.read().clone();
        let mut result = BroadcastResult::default();

        for subscription in &snapshot {
            if !subscription.active.load(Ordering::Acquire) {
                continue;
            }
            match subscription.sink.deliver(event) {
                Ok(()) => result.delivered += 1,
                Err(SinkError::Full) => {
                    result.skipped += 1;
                    tracing::warn!(
                        subscriber_id = %subscription.id,
                        label = %subscription.label,
                        "Subscriber full, event dropped"
                    );
                }
                Err(SinkError::Disconnected) => result.failed_ids.push(subscription.id),
            }
        }

        if !result.failed_ids.is_empty() {
            self.remove_failed(&result.failed_ids);
        }
        result
    }

    fn remove_failed(&self, failed: &[SubscriberId]) {
        let mut inner = self.inner.write();
        inner.retain(|subscription| {
            if failed.contains(&subscription.id) {
                subscription.active.store(false, Ordering::Release);
                tracing::info!(
                    subscriber_id = %subscription.id,
                    label = %subscription.label,
                    "Dropping disconnected subscriber"
                );
                false
            } else {
                true
            }
        });
    }

    /// Remove sinks that report themselves disconnected
    ///
    /// Returns the number of sinks removed.
    pub fn cleanup_disconnected(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|subscription| {
            let connected = subscription.sink.is_connected();
            if !connected {
                subscription.active.store(false, Ordering::Release);
            }
            connected
        });
        let removed = before - inner.len();
        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = inner.len(),
                "Cleaned up disconnected subscribers"
            );
        }
        removed
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if an ID is subscribed
    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.inner.read().iter().any(|s| s.id == id)
    }

    /// IDs of all subscriptions, in registration order
    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.inner.read().iter().map(|s| s.id).collect()
    }

    /// Per-subscription summary, in registration order
    #[must_use]
    pub fn summary(&self) -> Vec<SubscriberInfo> {
        self.inner
            .read()
            .iter()
            .map(|s| SubscriberInfo {
                id: s.id,
                label: s.label.clone(),
                uptime_secs: s.subscribed_at.elapsed().as_secs(),
            })
            .collect()
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Broadcaster")
            .field("subscriber_count", &inner.len())
            .field(
                "subscribers",
                &inner.iter().map(|s| s.id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

//! Symbol Sets and Consumer Fan-out
//!
//! A [`SymbolSet`] is the caller-facing handle for one subscribed series. It
//! holds an ordered list of [`Consumer`] registrations and dispatches every
//! parsed update to each of them in registration order.
//!
//! # Delivery
//!
//! Delivery is synchronous on the engine's receive task. A slow consumer
//! delays frame processing for every symbol set sharing the connection;
//! consumers that need to do heavy work should hand updates off to their own
//! queue or task.
//!
//! A consumer that returns an error, or panics, is isolated: the fault is
//! collected into the [`DeliveryReport`] and delivery continues with the next
//! consumer.
//!
//! Bar time never moves backwards for a consumer. A replayed session's
//! initial series load repeats history that was already delivered; bars
//! older than the last delivered one are dropped.

use std::borrow::Cow;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::streaming::{Bar, SymbolKey, Update};
use super::subscription::{SessionId, Subscription, SubscriptionError, SubscriptionStatus};

// =============================================================================
// Consumer
// =============================================================================

/// Error raised by a consumer callback.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The callback returned an error.
    #[error("consumer failed: {0}")]
    Failed(#[from] anyhow::Error),

    /// The callback panicked.
    #[error("consumer panicked: {0}")]
    Panicked(String),
}

/// A registered receiver of updates for one symbol set.
///
/// Only [`Consumer::on_update`] is required. The lifecycle hooks default to
/// no-ops.
#[cfg_attr(test, mockall::automock)]
pub trait Consumer: Send + Sync {
    /// Handle one update.
    ///
    /// # Errors
    ///
    /// Any error is isolated to this consumer and reported on the engine's
    /// fault channel; delivery to other consumers is unaffected.
    fn on_update(&self, update: &Update) -> Result<(), ConsumerError>;

    /// The subscription failed and no further updates will arrive until the
    /// caller subscribes again.
    fn on_error(&self, _error: &SubscriptionError) {}

    /// The symbol set was released by unsubscribe or engine shutdown.
    fn on_closed(&self) {}
}

/// Adapter turning a closure into a [`Consumer`].
pub struct FnConsumer<F>(F);

impl<F> FnConsumer<F>
where
    F: Fn(&Update) -> Result<(), ConsumerError> + Send + Sync,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Consumer for FnConsumer<F>
where
    F: Fn(&Update) -> Result<(), ConsumerError> + Send + Sync,
{
    fn on_update(&self, update: &Update) -> Result<(), ConsumerError> {
        (self.0)(update)
    }
}

/// Identity of a consumer registration: its registration order within the
/// symbol set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerHandle(u64);

impl ConsumerHandle {
    /// Registration order (0 for the first consumer of a symbol set).
    #[must_use]
    pub const fn order(self) -> u64 {
        self.0
    }
}

/// A consumer fault observed during delivery.
#[derive(Debug, Clone)]
pub struct ConsumerFault {
    /// Series being delivered.
    pub key: SymbolKey,
    /// Faulting consumer.
    pub consumer: ConsumerHandle,
    /// What went wrong.
    pub error: Arc<ConsumerError>,
}

/// Outcome of delivering one update to a symbol set.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Consumers that handled the update successfully.
    pub delivered: usize,
    /// Consumers that returned an error or panicked.
    pub faults: Vec<ConsumerFault>,
}

/// Which bars a symbol set passes to its consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Every decoded bar, including repeated updates of the forming bar.
    #[default]
    EveryUpdate,
    /// Each bar once, after a bar with a later timestamp has opened.
    ClosedBarsOnly,
}

// =============================================================================
// Symbol Set
// =============================================================================

struct Registration {
    handle: ConsumerHandle,
    consumer: Arc<dyn Consumer>,
}

/// Shared handle to a symbol set.
pub type SymbolSetHandle = Arc<SymbolSet>;

/// Caller-facing handle for one subscribed series.
pub struct SymbolSet {
    key: SymbolKey,
    policy: DeliveryPolicy,
    consumers: Mutex<Vec<Registration>>,
    next_consumer: AtomicU64,
    forming_bar: Mutex<Option<Bar>>,
    last_delivered: Mutex<Option<DateTime<Utc>>>,
    subscription: RwLock<Subscription>,
}

impl fmt::Debug for SymbolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolSet")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .field("consumers", &self.consumer_count())
            .field("subscription", &*self.subscription.read())
            .finish()
    }
}

impl SymbolSet {
    pub(crate) fn new(key: SymbolKey, session_id: SessionId, policy: DeliveryPolicy) -> Self {
        let subscription = Subscription {
            key: key.clone(),
            session_id,
            status: SubscriptionStatus::Pending,
        };
        Self {
            key,
            policy,
            consumers: Mutex::new(Vec::new()),
            next_consumer: AtomicU64::new(0),
            forming_bar: Mutex::new(None),
            last_delivered: Mutex::new(None),
            subscription: RwLock::new(subscription),
        }
    }

    /// The series this set delivers.
    #[must_use]
    pub const fn key(&self) -> &SymbolKey {
        &self.key
    }

    /// Delivery policy chosen when the set was created.
    #[must_use]
    pub const fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Snapshot of the underlying subscription.
    #[must_use]
    pub fn subscription(&self) -> Subscription {
        self.subscription.read().clone()
    }

    /// Current subscription status.
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        self.subscription.read().status
    }

    /// Current chart session identifier.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.subscription.read().session_id.clone()
    }

    /// Register a consumer; it receives updates after all earlier ones.
    pub fn create_consumer(&self, consumer: Arc<dyn Consumer>) -> ConsumerHandle {
        let handle = ConsumerHandle(self.next_consumer.fetch_add(1, Ordering::Relaxed));
        self.consumers.lock().push(Registration { handle, consumer });
        handle
    }

    /// Register a closure as a consumer.
    pub fn create_consumer_fn<F>(&self, f: F) -> ConsumerHandle
    where
        F: Fn(&Update) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        self.create_consumer(Arc::new(FnConsumer::new(f)))
    }

    /// Remove one consumer. Returns `false` if it was not registered.
    ///
    /// Takes effect for the next update. A delivery already in progress on
    /// the receive task works from its own snapshot of the consumer list, so
    /// the removed consumer may still see that one update.
    pub fn remove_consumer(&self, handle: ConsumerHandle) -> bool {
        let mut consumers = self.consumers.lock();
        let before = consumers.len();
        consumers.retain(|registration| registration.handle != handle);
        consumers.len() != before
    }

    /// Number of registered consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Deliver one update to every consumer in registration order.
    ///
    /// Nothing is delivered once the set is failed or released.
    pub fn deliver(&self, update: &Update) -> DeliveryReport {
        if matches!(
            self.status(),
            SubscriptionStatus::Failed | SubscriptionStatus::Released
        ) {
            return DeliveryReport::default();
        }

        let Some(update) = self.apply_policy(update) else {
            return DeliveryReport::default();
        };

        let mut report = DeliveryReport::default();
        for (handle, consumer) in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| consumer.on_update(&update)));
            let error = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(error)) => error,
                Err(panic) => ConsumerError::Panicked(panic_message(panic.as_ref())),
            };
            report.faults.push(ConsumerFault {
                key: self.key.clone(),
                consumer: handle,
                error: Arc::new(error),
            });
        }
        report
    }

    /// Tell every consumer the subscription failed.
    pub fn notify_error(&self, error: &SubscriptionError) {
        for (handle, consumer) in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| consumer.on_error(error))).is_err() {
                tracing::warn!(key = %self.key, consumer = handle.order(), "consumer panicked in on_error");
            }
        }
    }

    /// Drop every consumer, calling `on_closed` on each.
    pub(crate) fn close(&self) {
        let drained: Vec<Registration> = std::mem::take(&mut *self.consumers.lock());
        for registration in drained {
            let consumer = registration.consumer;
            if catch_unwind(AssertUnwindSafe(|| consumer.on_closed())).is_err() {
                tracing::warn!(
                    key = %self.key,
                    consumer = registration.handle.order(),
                    "consumer panicked in on_closed"
                );
            }
        }
    }

    pub(crate) fn rebind(&self, session_id: SessionId, status: SubscriptionStatus) {
        let mut subscription = self.subscription.write();
        subscription.session_id = session_id;
        subscription.status = status;
    }

    pub(crate) fn set_status(&self, status: SubscriptionStatus) {
        self.subscription.write().status = status;
    }

    pub(crate) fn activate(&self) {
        let mut subscription = self.subscription.write();
        if subscription.status == SubscriptionStatus::Pending {
            subscription.status = SubscriptionStatus::Active;
        }
    }

    fn snapshot(&self) -> Vec<(ConsumerHandle, Arc<dyn Consumer>)> {
        self.consumers
            .lock()
            .iter()
            .map(|registration| (registration.handle, Arc::clone(&registration.consumer)))
            .collect()
    }

    fn apply_policy<'a>(&self, update: &'a Update) -> Option<Cow<'a, Update>> {
        match self.policy {
            DeliveryPolicy::EveryUpdate => {
                let mut last = self.last_delivered.lock();
                // Same-time updates are the forming bar changing
                if last.is_some_and(|time| update.bar.time < time) {
                    return None;
                }
                *last = Some(update.bar.time);
                Some(Cow::Borrowed(update))
            }
            DeliveryPolicy::ClosedBarsOnly => {
                let mut forming = self.forming_bar.lock();
                let forming_time = forming.as_ref().map(|bar| bar.time);
                match forming_time {
                    // Late update for an already closed bar
                    Some(time) if update.bar.time < time => None,
                    Some(time) if update.bar.time > time => {
                        forming.replace(update.bar.clone()).map(|closed| {
                            Cow::Owned(Update {
                                key: self.key.clone(),
                                bar: closed,
                            })
                        })
                    }
                    _ => {
                        *forming = Some(update.bar.clone());
                        None
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

// =============================================================================
// Tests
// =============================================================================

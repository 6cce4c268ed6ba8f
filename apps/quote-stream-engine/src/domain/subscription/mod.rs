//! Session Registry
//!
//! Tracks logical subscriptions (one per symbol/exchange/interval key), maps
//! each to a server-side chart session identifier, and routes incoming data
//! to the owning symbol set.
//!
//! # Design
//!
//! The registry keeps:
//! - Reference counts per key, so repeated subscribes share one session
//! - A direct session id -> symbol set map for O(1) routing
//! - Registration order, used when replaying subscriptions after a reconnect
//!
//! The registry itself is not synchronized. The engine guards it, together
//! with the connection state, behind a single mutex and never holds that
//! mutex across consumer callbacks or socket I/O.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use rand::Rng;
use serde::Serialize;

use super::fanout::{DeliveryPolicy, SymbolSet, SymbolSetHandle};
use super::streaming::SymbolKey;

/// Prefix of every chart session identifier.
const SESSION_PREFIX: &str = "cs_";

/// Number of random letters following the prefix.
const SESSION_SUFFIX_LEN: usize = 12;

// =============================================================================
// Session Identifier
// =============================================================================

/// Chart session identifier correlating a subscription with its data frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session identifier (`cs_` + 12 lowercase letters).
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..SESSION_SUFFIX_LEN)
            .map(|_| char::from(rng.random_range(b'a'..=b'z')))
            .collect();
        Self(format!("{SESSION_PREFIX}{suffix}"))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Session requested, not yet confirmed by the peer.
    Pending,
    /// Peer confirmed the session or data is flowing.
    Active,
    /// Peer rejected the session, or the connection was permanently lost.
    Failed,
    /// Removed by unsubscribe or engine shutdown.
    Released,
}

/// A logical subscription as seen by its symbol set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// The subscribed series.
    pub key: SymbolKey,
    /// Current chart session identifier.
    pub session_id: SessionId,
    /// Current status.
    pub status: SubscriptionStatus,
}

/// Subscription-level failures, reported to the affected symbol set only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The peer refused to open (or reopen) the session.
    #[error("subscription {key} rejected: {reason}")]
    Rejected {
        /// Affected series.
        key: SymbolKey,
        /// Reason given by the peer.
        reason: String,
    },

    /// Reconnect attempts were exhausted while the subscription was live.
    #[error("subscription {key} lost: connection permanently disconnected")]
    ConnectionLost {
        /// Affected series.
        key: SymbolKey,
    },
}

// =============================================================================
// Registry Results
// =============================================================================

/// Result of a subscribe call.
#[derive(Debug)]
pub struct Subscribed {
    /// The (possibly shared) symbol set for the key.
    pub handle: SymbolSetHandle,
    /// Rejected session still held by the peer; delete it before `open`.
    pub close: Option<SessionId>,
    /// Session to open on the peer; `None` when an existing session is reused.
    pub open: Option<SessionId>,
}

/// Result of an unsubscribe call.
#[derive(Debug)]
pub enum Unsubscribed {
    /// Other holders remain; nothing to tear down.
    Retained {
        /// Remaining reference count.
        refcount: usize,
    },
    /// Last holder gone; the entry was removed.
    Released {
        /// The symbol set to close.
        handle: SymbolSetHandle,
        /// Session to delete on the peer, if one was live.
        close: Option<SessionId>,
    },
    /// The handle is not (or no longer) registered.
    Unknown,
}

/// Session counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionCounts {
    /// Sessions awaiting confirmation.
    pub pending: usize,
    /// Confirmed sessions.
    pub active: usize,
    /// Failed subscriptions still held by callers.
    pub failed: usize,
}

// =============================================================================
// Session Registry
// =============================================================================

#[derive(Debug)]
struct Entry {
    set: SymbolSetHandle,
    refcount: usize,
    /// A rejected chart session the peer still holds on the current
    /// connection. Cleared when the connection is replaced.
    lingering: Option<SessionId>,
}

/// Registry of logical subscriptions keyed by symbol/exchange/interval.
///
/// # Example
///
/// ```rust
/// use quote_stream_engine::domain::fanout::DeliveryPolicy;
/// use quote_stream_engine::domain::streaming::{Interval, SymbolKey};
/// use quote_stream_engine::domain::subscription::{SessionRegistry, Unsubscribed};
///
/// let mut registry = SessionRegistry::new();
/// let key = SymbolKey::new("BTCUSD", "BINANCE", Interval::Minute1);
///
/// let first = registry.subscribe(key.clone(), DeliveryPolicy::EveryUpdate);
/// assert!(first.open.is_some());
///
/// // Second subscribe shares the session
/// let second = registry.subscribe(key.clone(), DeliveryPolicy::EveryUpdate);
/// assert!(second.open.is_none());
/// assert_eq!(registry.refcount(&key), 2);
///
/// assert!(matches!(registry.unsubscribe(&second.handle), Unsubscribed::Retained { refcount: 1 }));
/// assert!(matches!(registry.unsubscribe(&first.handle), Unsubscribed::Released { .. }));
/// ```
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: IndexMap<SymbolKey, Entry>,
    sessions: HashMap<SessionId, SymbolSetHandle>,
    dropped_unknown: u64,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a key.
    ///
    /// Idempotent per key: an existing entry has its reference count
    /// incremented and its symbol set returned. A failed entry is given a
    /// fresh session so the caller's subscribe acts as a retry; the rejected
    /// session comes back in `close`. The delivery policy only applies when
    /// the entry is first created.
    pub fn subscribe(&mut self, key: SymbolKey, policy: DeliveryPolicy) -> Subscribed {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refcount += 1;
            let handle = Arc::clone(&entry.set);

            if handle.status() != SubscriptionStatus::Failed {
                return Subscribed {
                    handle,
                    close: None,
                    open: None,
                };
            }

            let close = entry.lingering.take();
            let session_id = fresh_session_id(&self.sessions);
            handle.rebind(session_id.clone(), SubscriptionStatus::Pending);
            self.sessions.insert(session_id.clone(), Arc::clone(&handle));
            return Subscribed {
                handle,
                close,
                open: Some(session_id),
            };
        }

        let session_id = fresh_session_id(&self.sessions);
        let handle = Arc::new(SymbolSet::new(key.clone(), session_id.clone(), policy));
        self.sessions.insert(session_id.clone(), Arc::clone(&handle));
        self.entries.insert(
            key,
            Entry {
                set: Arc::clone(&handle),
                refcount: 1,
                lingering: None,
            },
        );

        Subscribed {
            handle,
            close: None,
            open: Some(session_id),
        }
    }

    /// Release one reference to a symbol set.
    ///
    /// The handle must be the instance this registry issued for its key; a
    /// stale handle from a released entry is reported as [`Unsubscribed::Unknown`].
    pub fn unsubscribe(&mut self, handle: &SymbolSetHandle) -> Unsubscribed {
        let Some(entry) = self.entries.get_mut(handle.key()) else {
            return Unsubscribed::Unknown;
        };
        if !Arc::ptr_eq(&entry.set, handle) {
            return Unsubscribed::Unknown;
        }

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return Unsubscribed::Retained {
                refcount: entry.refcount,
            };
        }

        // Preserve registration order of the remaining entries
        let Some(entry) = self.entries.shift_remove(handle.key()) else {
            return Unsubscribed::Unknown;
        };

        let subscription = entry.set.subscription();
        let close = if subscription.status == SubscriptionStatus::Failed {
            entry.lingering
        } else {
            self.sessions.remove(&subscription.session_id);
            Some(subscription.session_id)
        };
        entry.set.set_status(SubscriptionStatus::Released);

        Unsubscribed::Released {
            handle: entry.set,
            close,
        }
    }

    /// Route an incoming data frame by session id.
    ///
    /// A pending subscription becomes active on its first data frame.
    /// Unknown sessions (late frames for torn-down sessions) are counted and
    /// dropped.
    pub fn route(&mut self, session_id: &str) -> Option<SymbolSetHandle> {
        let Some(set) = self.sessions.get(session_id) else {
            self.dropped_unknown += 1;
            return None;
        };
        set.activate();
        Some(Arc::clone(set))
    }

    /// Mark a session as confirmed by the peer.
    ///
    /// Returns `false` for unknown sessions.
    pub fn acknowledge(&mut self, session_id: &str) -> bool {
        self.sessions.get(session_id).is_some_and(|set| {
            set.activate();
            true
        })
    }

    /// Record a peer rejection for a session.
    ///
    /// The subscription moves to Failed and stops receiving data. The peer
    /// keeps the chart session itself, so it is remembered and handed back
    /// for deletion on unsubscribe or retry. Returns the affected symbol set
    /// and the error to notify it with, or `None` for an unknown session.
    pub fn reject(
        &mut self,
        session_id: &str,
        reason: impl Into<String>,
    ) -> Option<(SymbolSetHandle, SubscriptionError)> {
        let (session_id, set) = self.sessions.remove_entry(session_id)?;
        set.set_status(SubscriptionStatus::Failed);
        if let Some(entry) = self.entries.get_mut(set.key()) {
            entry.lingering = Some(session_id);
        }
        let error = SubscriptionError::Rejected {
            key: set.key().clone(),
            reason: reason.into(),
        };
        Some((set, error))
    }

    /// Issue fresh session ids to every non-failed subscription.
    ///
    /// Returns the sessions to open, in original registration order. Called
    /// after each successful (re)connection; old session ids stop routing.
    pub fn rebind_for_replay(&mut self) -> Vec<(SymbolKey, SessionId)> {
        let mut replay = Vec::new();

        for (key, entry) in &mut self.entries {
            // Sessions of the previous connection died with it
            entry.lingering = None;
            let current = entry.set.subscription();
            if current.status == SubscriptionStatus::Failed {
                continue;
            }

            self.sessions.remove(&current.session_id);
            let session_id = fresh_session_id(&self.sessions);
            entry
                .set
                .rebind(session_id.clone(), SubscriptionStatus::Pending);
            self.sessions.insert(session_id.clone(), Arc::clone(&entry.set));
            replay.push((key.clone(), session_id));
        }

        replay
    }

    /// Fail every live subscription after a permanent disconnect.
    ///
    /// Returns the symbol sets to notify.
    pub fn fail_all(&mut self) -> Vec<(SymbolSetHandle, SubscriptionError)> {
        self.sessions.clear();

        let mut failures = Vec::new();
        for entry in self.entries.values_mut() {
            entry.lingering = None;
            if entry.set.status() == SubscriptionStatus::Failed {
                continue;
            }
            entry.set.set_status(SubscriptionStatus::Failed);
            let error = SubscriptionError::ConnectionLost {
                key: entry.set.key().clone(),
            };
            failures.push((Arc::clone(&entry.set), error));
        }
        failures
    }

    /// Remove every entry (engine shutdown).
    ///
    /// Returns the released symbol sets in registration order.
    pub fn release_all(&mut self) -> Vec<SymbolSetHandle> {
        self.sessions.clear();

        self.entries
            .drain(..)
            .map(|(_, entry)| {
                entry.set.set_status(SubscriptionStatus::Released);
                entry.set
            })
            .collect()
    }

    /// Look up the symbol set for a key.
    #[must_use]
    pub fn get(&self, key: &SymbolKey) -> Option<SymbolSetHandle> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.set))
    }

    /// Current reference count for a key (zero when absent).
    #[must_use]
    pub fn refcount(&self, key: &SymbolKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.refcount)
    }

    /// Number of distinct subscribed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of routable sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Frames dropped because their session was unknown.
    #[must_use]
    pub const fn dropped_unknown(&self) -> u64 {
        self.dropped_unknown
    }

    /// Subscription counts by status.
    #[must_use]
    pub fn counts(&self) -> SubscriptionCounts {
        let mut counts = SubscriptionCounts::default();
        for entry in self.entries.values() {
            match entry.set.status() {
                SubscriptionStatus::Pending => counts.pending += 1,
                SubscriptionStatus::Active => counts.active += 1,
                SubscriptionStatus::Failed => counts.failed += 1,
                SubscriptionStatus::Released => {}
            }
        }
        counts
    }
}

fn fresh_session_id(sessions: &HashMap<SessionId, SymbolSetHandle>) -> SessionId {
    loop {
        let candidate = SessionId::generate();
        if !sessions.contains_key(&candidate) {
            return candidate;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

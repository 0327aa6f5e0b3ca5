//! # Notifications
//!
//! Registry of interest in resources and requests.
//!
//! The reactivity layer that renders data lives outside this crate. It
//! subscribes here and is told *what* changed, never *how*; it reads the new
//! state back through the store.
//!
//! Inside a store transaction notifications are buffered and delivered only
//! on commit. A rolled-back transaction delivers nothing.

use crate::{ChangeKind, Subject};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&Subject, ChangeKind) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Every notification.
    Any,
    /// Every resource notification.
    Resources,
    /// Every request notification.
    Requests,
    /// One subject only.
    Subject(Subject),
}

impl Interest {
    fn matches(&self, subject: &Subject) -> bool {
        match self {
            Self::Any => true,
            Self::Resources => matches!(subject, Subject::Resource(_)),
            Self::Requests => matches!(subject, Subject::Request(_)),
            Self::Subject(wanted) => wanted == subject,
        }
    }
}

/// The notification manager for one store.
#[derive(Default)]
pub struct NotificationManager {
    subscribers: BTreeMap<SubscriptionToken, (Interest, Callback)>,
    next_token: u64,
    /// Buffered notifications in first-report order
    pending: Vec<(Subject, ChangeKind)>,
    /// The same notifications, for de-duplication
    queued: BTreeSet<(Subject, ChangeKind)>,
    /// `pending.len()` at each open transaction
    marks: Vec<usize>,
}

impl fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationManager")
            .field("subscribers", &self.subscribers.len())
            .field("pending", &self.pending.len())
            .field("depth", &self.marks.len())
            .finish()
    }
}

impl NotificationManager {
    /// Create a manager with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest.
    pub fn subscribe(&mut self, interest: Interest, callback: Callback) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token);
        self.next_token = self.next_token.saturating_add(1);
        self.subscribers.insert(token, (interest, callback));
        token
    }

    /// Remove a subscription. Returns `false` if the token was unknown.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        self.subscribers.remove(&token).is_some()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Report a change. Delivered immediately outside a transaction,
    /// buffered inside one.
    pub fn notify(&mut self, subject: Subject, change: ChangeKind) {
        if !self.marks.is_empty() {
            if self.queued.insert((subject.clone(), change)) {
                self.pending.push((subject, change));
            }
            return;
        }
        self.deliver(&subject, change);
    }

    /// Start buffering.
    pub fn begin(&mut self) {
        self.marks.push(self.pending.len());
    }

    /// Leave a transaction; the outermost commit delivers the buffer.
    pub fn commit(&mut self) {
        self.marks.pop();
        if self.marks.is_empty() {
            self.queued.clear();
            let pending = std::mem::take(&mut self.pending);
            for (subject, change) in &pending {
                self.deliver(subject, *change);
            }
        }
    }

    /// Leave a transaction, discarding everything buffered since it began.
    pub fn rollback(&mut self) {
        let Some(mark) = self.marks.pop() else {
            return;
        };
        for item in self.pending.drain(mark..) {
            self.queued.remove(&item);
        }
    }

    /// Number of notifications buffered by open transactions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn deliver(&self, subject: &Subject, change: ChangeKind) {
        for (interest, callback) in self.subscribers.values() {
            if interest.matches(subject) {
                callback(subject, change);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

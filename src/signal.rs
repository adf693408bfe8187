//! Process-wide notification signals
//!
//! Fan-out of state changes to observers that do not own a session.
//!
//! ## Architecture
//!
//! ```text
//! Attachment (origin A) ──publish──┐
//! Attachment (origin B) ──publish──┤
//!                                  └─► SignalBus (broadcast)
//!                                          │
//!                                          ├─► other attachments (same identity, other origin)
//!                                          └─► MirrorView (badge, popup, ...)
//! ```
//!
//! Observers re-derive their lists with the same `merge`/`apply` functions the
//! attachment uses, so no network fetch is repeated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::mutation::apply;
use crate::normalize::merge;
use crate::types::{Identity, MutationEvent, NotificationRecord};

/// Capacity of the process-wide bus.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 256;

static GLOBAL: OnceLock<SignalBus> = OnceLock::new();
static ORIGINS: AtomicU64 = AtomicU64::new(1);

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// A read/delete change was applied
    Mutation(MutationEvent),
    /// A new notification arrived in real time
    Received(NotificationRecord),
}

/// One signal on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSignal {
    pub identity: Identity,
    /// Publisher id; subscribers skip their own signals
    pub origin: u64,
    pub event: SignalEvent,
}

/// Typed in-process publish/subscribe channel.
#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<NotificationSignal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// The process-wide bus.
    pub fn global() -> &'static SignalBus {
        Self::global_with_capacity(DEFAULT_SIGNAL_CAPACITY)
    }

    /// The process-wide bus, sized by the first caller.
    pub fn global_with_capacity(capacity: usize) -> &'static SignalBus {
        GLOBAL.get_or_init(|| SignalBus::new(capacity))
    }

    /// Allocate a fresh publisher id.
    pub fn next_origin() -> u64 {
        ORIGINS.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish to every current subscriber; returns how many received it.
    pub fn publish(&self, signal: NotificationSignal) -> usize {
        match self.sender.send(signal) {
            Ok(n) => n,
            Err(_) => {
                debug!("No signal subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationSignal> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_CAPACITY)
    }
}

/// Apply one signal to a list.
pub fn apply_signal(list: &[NotificationRecord], event: &SignalEvent) -> Vec<NotificationRecord> {
    match event {
        SignalEvent::Mutation(mutation) => apply(list, mutation),
        SignalEvent::Received(record) => merge(list, record.clone()),
    }
}

/// Read-only copy of one identity's list kept current from the bus.
pub struct MirrorView {
    identity: Identity,
    receiver: broadcast::Receiver<NotificationSignal>,
    records: Vec<NotificationRecord>,
    stale: bool,
}

impl MirrorView {
    pub fn new(bus: &SignalBus, identity: Identity, initial: Vec<NotificationRecord>) -> Self {
        Self {
            identity,
            receiver: bus.subscribe(),
            records: initial,
            stale: false,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn records(&self) -> &[NotificationRecord] {
        &self.records
    }

    pub fn unread_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_read).count()
    }

    /// True once signals were missed; the owner should re-fetch and [`reset`](Self::reset).
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn reset(&mut self, records: Vec<NotificationRecord>) {
        self.records = records;
        self.stale = false;
    }

    /// Apply every pending signal without waiting. Returns how many were applied.
    pub fn sync(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(signal) => {
                    if self.absorb(signal) {
                        applied += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => self.mark_stale(missed),
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return applied,
            }
        }
    }

    /// Wait for the next signal for this identity and apply it.
    ///
    /// Returns early, without applying anything, if the view fell behind.
    pub async fn changed(&mut self) -> Result<(), NotifyError> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) => {
                    if self.absorb(signal) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.mark_stale(missed);
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Closed) => return Err(NotifyError::Closed),
            }
        }
    }

    fn absorb(&mut self, signal: NotificationSignal) -> bool {
        if signal.identity != self.identity {
            return false;
        }
        self.records = apply_signal(&self.records, &signal.event);
        true
    }

    fn mark_stale(&mut self, missed: u64) {
        warn!(identity = %self.identity, missed = missed, "Mirror view lagged behind signal bus");
        self.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotificationPayload;
    use chrono::Utc;

    fn rec(id: &str) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            payload: NotificationPayload::default(),
            created_at: Utc::now(),
            is_read: false,
        }
    }

    fn signal(identity: &Identity, event: SignalEvent) -> NotificationSignal {
        NotificationSignal {
            identity: identity.clone(),
            origin: 7,
            event,
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = SignalBus::new(4);
        let sent = bus.publish(signal(
            &Identity::customer("u1"),
            SignalEvent::Mutation(MutationEvent::DeletedAll),
        ));
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_mirror_sync_filters_identity() {
        let bus = SignalBus::new(16);
        let me = Identity::customer("u1");
        let mut view = MirrorView::new(&bus, me.clone(), vec![rec("n1")]);

        bus.publish(signal(&me, SignalEvent::Received(rec("n2"))));
        bus.publish(signal(
            &Identity::shop("u1"),
            SignalEvent::Mutation(MutationEvent::DeletedAll),
        ));
        bus.publish(signal(
            &me,
            SignalEvent::Mutation(MutationEvent::MarkedRead("n1".into())),
        ));

        assert_eq!(view.sync(), 2);
        let ids: Vec<_> = view.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
        assert_eq!(view.unread_count(), 1);
        assert!(!view.is_stale());
    }

    #[test]
    fn test_mirror_lag_marks_stale() {
        let bus = SignalBus::new(2);
        let me = Identity::customer("u1");
        let mut view = MirrorView::new(&bus, me.clone(), Vec::new());
        for i in 0..5 {
            bus.publish(signal(&me, SignalEvent::Received(rec(&format!("n{}", i)))));
        }
        view.sync();
        assert!(view.is_stale());
        view.reset(Vec::new());
        assert!(!view.is_stale());
    }

    #[tokio::test]
    async fn test_mirror_changed_waits_for_own_identity() {
        let bus = SignalBus::new(16);
        let me = Identity::shop("s1");
        let mut view = MirrorView::new(&bus, me.clone(), vec![rec("a")]);

        let publisher = bus.clone();
        let target = me.clone();
        tokio::spawn(async move {
            publisher.publish(signal(
                &Identity::shop("other"),
                SignalEvent::Mutation(MutationEvent::DeletedAll),
            ));
            publisher.publish(signal(
                &target,
                SignalEvent::Mutation(MutationEvent::Deleted("a".into())),
            ));
        });

        view.changed().await.unwrap();
        assert!(view.records().is_empty());
    }
}

//! Subscription Manager
//!
//! Single responsibility: keep exactly one broker subscription per desired topic
//! on whatever physical connection the session currently has.
//!
//! # How it works
//!
//! - [`subscribe`] registers topics with the session driver and returns a
//!   [`SubscriptionHandle`]. Registration before the session is connected only
//!   queues the topics.
//! - The driver owns a [`SubscriptionTable`]. Every entry remembers which
//!   connection id it is active on, so a `CONNECTED` transition activates each
//!   entry exactly once, and a reconnect (new connection id) re-issues all of them.
//! - Handles asking for a destination that is already desired share its entry.
//!   The broker sees one SUBSCRIBE for the first owner and one UNSUBSCRIBE when
//!   the last owner leaves.
//! - [`SubscriptionHandle::release`] gives up the handle's topics. It is
//!   idempotent, never fails, and does nothing once the session is gone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::stomp::protocol::Frame;
use crate::stomp::session::{SessionCommand, TransportSession};
use crate::topic::Topic;

/// Register `topics` on `session`, one subscription per topic.
pub fn subscribe(session: &TransportSession, topics: &[Topic]) -> SubscriptionHandle {
    let owner = session.next_id();
    let subscriptions: Vec<(String, Topic)> = topics
        .iter()
        .map(|topic| (format!("sub-{}", session.next_id()), topic.clone()))
        .collect();

    let destinations: Vec<&str> = subscriptions
        .iter()
        .map(|(_, t)| t.destination.as_str())
        .collect();
    debug!(owner = owner, destinations = ?destinations, "Registering subscriptions");

    let commands = session.commands();
    if commands
        .send(SessionCommand::Register {
            owner,
            subscriptions,
        })
        .is_err()
    {
        debug!(owner = owner, "Session already closed; subscriptions not registered");
    }

    SubscriptionHandle {
        owner,
        topics: topics.to_vec(),
        commands,
        released: AtomicBool::new(false),
    }
}

/// Scoped ownership of a set of subscriptions. Dropping it releases them.
pub struct SubscriptionHandle {
    owner: u64,
    topics: Vec<Topic>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Unsubscribe every topic of this handle. Safe to call repeatedly.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self
            .commands
            .send(SessionCommand::Release { owner: self.owner })
            .is_err()
        {
            debug!(owner = self.owner, "Session already closed; nothing to release");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

struct Entry {
    topic: Topic,
    owners: BTreeSet<u64>,
    /// Connection id the SUBSCRIBE was sent on, if any
    active_on: Option<u64>,
}

/// Desired subscriptions of one session, keyed by subscription id.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: BTreeMap<String, Entry>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add subscriptions; returns the frames to send if currently connected.
    pub fn register(
        &mut self,
        owner: u64,
        subscriptions: Vec<(String, Topic)>,
        connection: Option<u64>,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        for (id, topic) in subscriptions {
            if let Some(entry) = self
                .entries
                .values_mut()
                .find(|e| e.topic.destination == topic.destination)
            {
                debug!(
                    destination = %topic.destination,
                    owner = owner,
                    "Sharing existing subscription"
                );
                entry.owners.insert(owner);
                continue;
            }
            if connection.is_some() {
                frames.push(Frame::subscribe(&id, &topic.destination));
            }
            self.entries.insert(
                id,
                Entry {
                    topic,
                    owners: BTreeSet::from([owner]),
                    active_on: connection,
                },
            );
        }
        frames
    }

    /// Remove `owner` from its subscriptions. Entries left without owners are
    /// dropped; returns UNSUBSCRIBE frames for the live ones among them.
    pub fn release(&mut self, owner: u64, connection: Option<u64>) -> Vec<Frame> {
        let mut orphaned = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if entry.owners.remove(&owner) && entry.owners.is_empty() {
                orphaned.push(id.clone());
            }
        }

        let mut frames = Vec::new();
        for id in orphaned {
            if let Some(entry) = self.entries.remove(&id) {
                if connection.is_some() && entry.active_on == connection {
                    frames.push(Frame::unsubscribe(&id));
                }
            }
        }
        frames
    }

    /// Activate every entry not yet active on `connection`.
    pub fn activate(&mut self, connection: u64) -> Vec<Frame> {
        self.entries
            .iter_mut()
            .filter(|(_, e)| e.active_on != Some(connection))
            .map(|(id, e)| {
                e.active_on = Some(connection);
                Frame::subscribe(id, &e.topic.destination)
            })
            .collect()
    }

    /// Forget activation state; the physical connection is gone.
    pub fn deactivate(&mut self) {
        for entry in self.entries.values_mut() {
            entry.active_on = None;
        }
    }

    /// Number of entries active on `connection`.
    pub fn active_count(&self, connection: u64) -> usize {
        self.entries
            .values()
            .filter(|e| e.active_on == Some(connection))
            .count()
    }

    /// Find the topic an inbound MESSAGE belongs to.
    pub fn route(&self, frame: &Frame, connection: u64) -> Option<&Topic> {
        if let Some(id) = frame.get("subscription") {
            return self
                .entries
                .get(id)
                .filter(|e| e.active_on == Some(connection))
                .map(|e| &e.topic);
        }
        let destination = frame.get("destination")?;
        self.entries
            .values()
            .find(|e| e.active_on == Some(connection) && e.topic.destination == destination)
            .map(|e| &e.topic)
    }
}

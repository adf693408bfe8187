//! Core data model shared by every layer of the client.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of account a notification stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityKind {
    Customer,
    Shop,
}

impl IdentityKind {
    /// Path segment used by the broker for this kind.
    pub fn segment(self) -> &'static str {
        match self {
            IdentityKind::Customer => "user",
            IdentityKind::Shop => "shop",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKind::Customer => f.write_str("customer"),
            IdentityKind::Shop => f.write_str("shop"),
        }
    }
}

/// The (id, kind) pair a notification stream is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub kind: IdentityKind,
}

impl Identity {
    pub fn new(id: impl Into<String>, kind: IdentityKind) -> Self {
        Self { id: id.into(), kind }
    }

    pub fn customer(id: impl Into<String>) -> Self {
        Self::new(id, IdentityKind::Customer)
    }

    pub fn shop(id: impl Into<String>) -> Self {
        Self::new(id, IdentityKind::Shop)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Domain fields of a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    /// Raw `type` tag as sent by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,
    #[serde(default)]
    pub shop_owner: bool,
}

/// One delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub payload: NotificationPayload,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl NotificationRecord {
    /// Time elapsed since the notification was created, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }
}

/// A remote-originated instruction to change delivered state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum MutationEvent {
    MarkedRead(String),
    Deleted(String),
    MarkedAllRead,
    DeletedAll,
}

/// The observable value exposed to UI consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationState {
    /// Newest first, at most one record per id
    pub records: Vec<NotificationRecord>,
    pub connected: bool,
}

impl NotificationState {
    pub fn unread_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_read).count()
    }

    pub fn get(&self, id: &str) -> Option<&NotificationRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}

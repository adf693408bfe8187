//! Mutation event processing
//!
//! Read/delete updates arrive on the mutation channel as
//! `{ "updateType": ..., "notificationId": ... }`. Applying an event to a list is
//! pure and tolerant of ids the list does not hold.

use serde::Deserialize;
use serde_json::Value;

use crate::error::FrameError;
use crate::types::{MutationEvent, NotificationRecord};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMutation {
    update_type: Option<String>,
    #[serde(default)]
    notification_id: Option<Value>,
}

/// Parse one mutation frame body.
pub fn parse_mutation(raw: &str) -> Result<MutationEvent, FrameError> {
    let wire: WireMutation = serde_json::from_str(raw)?;
    let update_type = wire
        .update_type
        .ok_or(FrameError::MissingField("updateType"))?;

    let target = || match wire.notification_id.as_ref() {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(FrameError::MissingField("notificationId")),
    };

    match update_type.as_str() {
        "MARKED_AS_READ" => Ok(MutationEvent::MarkedRead(target()?)),
        "DELETED" => Ok(MutationEvent::Deleted(target()?)),
        "MARKED_ALL_AS_READ" => Ok(MutationEvent::MarkedAllRead),
        "DELETED_ALL" => Ok(MutationEvent::DeletedAll),
        _ => Err(FrameError::UnknownUpdateType(update_type)),
    }
}

/// Apply `event` to `list`. Unknown ids leave the list unchanged.
pub fn apply(list: &[NotificationRecord], event: &MutationEvent) -> Vec<NotificationRecord> {
    match event {
        MutationEvent::MarkedRead(id) => list
            .iter()
            .cloned()
            .map(|mut r| {
                if &r.id == id {
                    r.is_read = true;
                }
                r
            })
            .collect(),
        MutationEvent::Deleted(id) => list.iter().filter(|r| &r.id != id).cloned().collect(),
        MutationEvent::MarkedAllRead => list
            .iter()
            .cloned()
            .map(|mut r| {
                r.is_read = true;
                r
            })
            .collect(),
        MutationEvent::DeletedAll => Vec::new(),
    }
}

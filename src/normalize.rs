//! Message normalization and deduplication
//!
//! Inbound payloads are loosely typed JSON. They are validated here into
//! [`NotificationRecord`] or rejected with a [`FrameError`]; nothing past this
//! boundary sees raw JSON.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::FrameError;
use crate::types::{NotificationPayload, NotificationRecord};

/// Parse one new-item frame body, stamping missing timestamps with the current time.
pub fn normalize(raw: &str) -> Result<NotificationRecord, FrameError> {
    normalize_at(raw, Utc::now())
}

/// Parse one new-item frame body received at `arrival`.
pub fn normalize_at(raw: &str, arrival: DateTime<Utc>) -> Result<NotificationRecord, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    from_value(&value, arrival)
}

/// Validate an already-decoded JSON value.
pub fn from_value(value: &Value, arrival: DateTime<Utc>) -> Result<NotificationRecord, FrameError> {
    let obj = value.as_object().ok_or(FrameError::MissingField("id"))?;

    let id = scalar(obj, "id")
        .filter(|id| !id.is_empty())
        .ok_or(FrameError::MissingField("id"))?;

    let created_at = match first_present(obj, &["creationTimestamp", "createdAt"]) {
        Some(ts) => parse_timestamp(ts)?,
        None => arrival,
    };

    let is_read = first_present(obj, &["isRead", "read"])
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let payload = NotificationPayload {
        title: scalar(obj, "title").unwrap_or_default(),
        message: scalar(obj, "message").unwrap_or_default(),
        order_id: scalar(obj, "orderId"),
        action_url: scalar(obj, "actionUrl"),
        kind: scalar(obj, "type"),
        user_id: scalar(obj, "userId"),
        shop_id: scalar(obj, "shopId"),
        shop_owner: obj
            .get("isShopOwnerNotification")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    };

    Ok(NotificationRecord {
        id,
        payload,
        created_at,
        is_read,
    })
}

/// String or number field as text; null and other shapes count as absent.
fn scalar(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// RFC 3339, naive ISO-8601 (UTC) or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, FrameError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| FrameError::InvalidTimestamp(n.to_string())),
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Ok(naive.and_utc());
            }
            s.parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .ok_or_else(|| FrameError::InvalidTimestamp(s.clone()))
        }
        other => Err(FrameError::InvalidTimestamp(other.to_string())),
    }
}

/// Prepend `record` unless its id is already known.
pub fn merge(list: &[NotificationRecord], record: NotificationRecord) -> Vec<NotificationRecord> {
    if list.iter().any(|r| r.id == record.id) {
        return list.to_vec();
    }
    let mut out = Vec::with_capacity(list.len() + 1);
    out.push(record);
    out.extend_from_slice(list);
    out
}

/// Fold a fetched baseline into the current list.
///
/// Baseline entries win for shared ids, push-only entries survive, and the result
/// is ordered newest first with ties keeping their current order.
pub fn reconcile(
    list: &[NotificationRecord],
    baseline: Vec<NotificationRecord>,
) -> Vec<NotificationRecord> {
    let mut out: Vec<NotificationRecord> = Vec::with_capacity(list.len() + baseline.len());
    let mut fresh = baseline;

    for current in list {
        match fresh.iter().position(|b| b.id == current.id) {
            Some(idx) => out.push(fresh.remove(idx)),
            None => out.push(current.clone()),
        }
    }
    for record in fresh {
        if !out.iter().any(|r| r.id == record.id) {
            out.push(record);
        }
    }

    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out
}

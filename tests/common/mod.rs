//! Shared test fixtures: an in-memory STOMP broker and a scripted REST API.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use notification_client::stomp::protocol::{decode_all, Command, Frame, Inbound};
use notification_client::{
    apply, Connector, Duplex, Identity, MutationEvent, NotificationApi, NotificationPayload,
    NotificationRecord, NotifyError,
};

/// What the broker saw on one physical connection.
#[derive(Debug, Default, Clone)]
pub struct ConnectionLog {
    pub endpoint: String,
    pub connect_headers: Vec<(String, String)>,
    /// subscription id -> destination, currently active
    pub subscriptions: BTreeMap<String, String>,
    pub unsubscribed: Vec<String>,
    pub frames: Vec<Frame>,
    pub heartbeats: usize,
    pub disconnected: bool,
    pub open: bool,
}

impl ConnectionLog {
    pub fn destinations(&self) -> Vec<String> {
        let mut out: Vec<String> = self.subscriptions.values().cloned().collect();
        out.sort();
        out
    }

    pub fn count(&self, command: Command) -> usize {
        self.frames.iter().filter(|f| f.command == command).count()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.connect_headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

struct Slot {
    log: ConnectionLog,
    to_client: Option<mpsc::UnboundedSender<String>>,
}

struct BrokerState {
    slots: Vec<Slot>,
    server_heartbeat: String,
    reject_connects: usize,
    next_message_id: u64,
}

/// In-memory STOMP broker implementing [`Connector`].
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                slots: Vec::new(),
                server_heartbeat: "0,0".to_string(),
                reject_connects: 0,
                next_message_id: 0,
            })),
        }
    }

    /// Value of the `heart-beat` header sent in CONNECTED.
    pub fn set_server_heartbeat(&self, value: &str) {
        self.state.lock().unwrap().server_heartbeat = value.to_string();
    }

    /// Answer the next `n` CONNECT frames with an ERROR frame.
    pub fn reject_next_connects(&self, n: usize) {
        self.state.lock().unwrap().reject_connects = n;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    /// Log of connection `n` (1-based).
    pub fn connection(&self, n: usize) -> ConnectionLog {
        self.state.lock().unwrap().slots[n - 1].log.clone()
    }

    pub fn latest(&self) -> Option<ConnectionLog> {
        self.state.lock().unwrap().slots.last().map(|s| s.log.clone())
    }

    /// Active subscriptions on the newest open connection.
    pub fn active_destinations(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .slots
            .iter()
            .rev()
            .find(|s| s.log.open)
            .map(|s| s.log.destinations())
            .unwrap_or_default()
    }

    /// Deliver `body` to every open subscription on `destination`. Returns the
    /// number of deliveries.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut deliveries = Vec::new();
        for slot in &state.slots {
            let Some(tx) = slot.to_client.as_ref() else { continue };
            for (id, dest) in &slot.log.subscriptions {
                if dest == destination {
                    deliveries.push((tx.clone(), id.clone()));
                }
            }
        }

        let mut delivered = 0;
        for (tx, id) in deliveries {
            state.next_message_id += 1;
            let frame = Frame::new(Command::Message)
                .header("subscription", id)
                .header("message-id", state.next_message_id.to_string())
                .header("destination", destination)
                .header("content-type", "application/json")
                .with_body(body);
            if tx.send(frame.encode()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Simulate a network drop of the newest open connection.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.iter_mut().rev().find(|s| s.log.open) {
            slot.to_client = None;
            slot.log.open = false;
            slot.log.subscriptions.clear();
        }
    }

    fn handle(&self, index: usize, text: &str) -> Result<(), NotifyError> {
        let mut state = self.state.lock().unwrap();
        let heartbeat = state.server_heartbeat.clone();

        if !state.slots[index].log.open {
            return Err(NotifyError::Connection("connection dropped".into()));
        }

        for item in decode_all(text)? {
            let frame = match item {
                Inbound::Heartbeat => {
                    state.slots[index].log.heartbeats += 1;
                    continue;
                }
                Inbound::Frame(frame) => frame,
            };

            let reply = match frame.command {
                Command::Connect | Command::Stomp => {
                    state.slots[index].log.connect_headers = frame.headers.clone();
                    if state.reject_connects > 0 {
                        state.reject_connects -= 1;
                        Some(
                            Frame::new(Command::Error)
                                .header("message", "Access denied")
                                .encode(),
                        )
                    } else {
                        Some(
                            Frame::new(Command::Connected)
                                .header("version", "1.2")
                                .header("heart-beat", heartbeat.clone())
                                .encode(),
                        )
                    }
                }
                Command::Subscribe => {
                    let id = frame.get("id").unwrap_or_default().to_string();
                    let dest = frame.get("destination").unwrap_or_default().to_string();
                    state.slots[index].log.subscriptions.insert(id, dest);
                    None
                }
                Command::Unsubscribe => {
                    let id = frame.get("id").unwrap_or_default().to_string();
                    let slot = &mut state.slots[index].log;
                    slot.subscriptions.remove(&id);
                    slot.unsubscribed.push(id);
                    None
                }
                Command::Disconnect => {
                    state.slots[index].log.disconnected = true;
                    frame
                        .get("receipt")
                        .map(|r| Frame::new(Command::Receipt).header("receipt-id", r).encode())
                }
                _ => None,
            };

            state.slots[index].log.frames.push(frame);
            if let (Some(reply), Some(tx)) = (reply, state.slots[index].to_client.as_ref()) {
                let _ = tx.send(reply);
            }
        }
        Ok(())
    }

    fn close(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        let slot = &mut state.slots[index];
        slot.to_client = None;
        slot.log.open = false;
        slot.log.subscriptions.clear();
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Duplex>, NotifyError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = {
            let mut state = self.state.lock().unwrap();
            state.slots.push(Slot {
                log: ConnectionLog {
                    endpoint: endpoint.to_string(),
                    open: true,
                    ..Default::default()
                },
                to_client: Some(tx),
            });
            state.slots.len() - 1
        };
        Ok(Box::new(MockDuplex {
            broker: self.clone(),
            index,
            inbound: rx,
        }))
    }
}

struct MockDuplex {
    broker: MockBroker,
    index: usize,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Duplex for MockDuplex {
    async fn send(&mut self, text: String) -> Result<(), NotifyError> {
        self.broker.handle(self.index, &text)
    }

    async fn recv(&mut self) -> Result<Option<String>, NotifyError> {
        Ok(self.inbound.recv().await)
    }

    async fn close(&mut self) {
        self.broker.close(self.index);
    }
}

/// Scripted REST API keeping a list per identity.
#[derive(Default)]
pub struct MockApi {
    lists: Mutex<HashMap<Identity, Vec<NotificationRecord>>>,
    fail: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list(self, identity: &Identity, records: Vec<NotificationRecord>) -> Self {
        self.lists.lock().unwrap().insert(identity.clone(), records);
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call(&self, name: String) -> Result<(), NotifyError> {
        self.calls.lock().unwrap().push(name);
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Api {
                status: 500,
                message: "Internal Server Error".into(),
            });
        }
        Ok(())
    }

    fn mutate(&self, identity: &Identity, event: MutationEvent) {
        let mut lists = self.lists.lock().unwrap();
        let list = lists.entry(identity.clone()).or_default();
        *list = apply(list, &event);
    }
}

#[async_trait]
impl NotificationApi for MockApi {
    async fn list(&self, identity: &Identity) -> Result<Vec<NotificationRecord>, NotifyError> {
        self.call(format!("list {}", identity))?;
        Ok(self
            .lists
            .lock()
            .unwrap()
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_read(&self, identity: &Identity, id: &str) -> Result<(), NotifyError> {
        self.call(format!("mark_read {} {}", identity, id))?;
        self.mutate(identity, MutationEvent::MarkedRead(id.to_string()));
        Ok(())
    }

    async fn mark_all_read(&self, identity: &Identity) -> Result<(), NotifyError> {
        self.call(format!("mark_all_read {}", identity))?;
        self.mutate(identity, MutationEvent::MarkedAllRead);
        Ok(())
    }

    async fn delete(&self, identity: &Identity, id: &str) -> Result<(), NotifyError> {
        self.call(format!("delete {} {}", identity, id))?;
        self.mutate(identity, MutationEvent::Deleted(id.to_string()));
        Ok(())
    }

    async fn delete_all(&self, identity: &Identity) -> Result<(), NotifyError> {
        self.call(format!("delete_all {}", identity))?;
        self.mutate(identity, MutationEvent::DeletedAll);
        Ok(())
    }
}

/// Record created at 2024-05-01 `hour`:00 UTC.
pub fn record(id: &str, hour: u32, is_read: bool) -> NotificationRecord {
    NotificationRecord {
        id: id.to_string(),
        payload: NotificationPayload {
            title: format!("Title {}", id),
            message: format!("Message {}", id),
            ..Default::default()
        },
        created_at: at(hour),
        is_read,
    }
}

pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
}

/// JSON body of a new-item frame.
pub fn new_item_json(id: &str, hour: u32) -> String {
    serde_json::json!({
        "id": id,
        "userId": "u1",
        "title": format!("Title {}", id),
        "message": format!("Message {}", id),
        "type": "ORDER_STATUS",
        "isRead": false,
        "creationTimestamp": at(hour).to_rfc3339(),
    })
    .to_string()
}

pub fn mutation_json(update_type: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => serde_json::json!({ "updateType": update_type, "notificationId": id }),
        None => serde_json::json!({ "updateType": update_type }),
    }
    .to_string()
}

/// Poll `condition` until it holds; panics after `limit` of (possibly virtual) time.
pub async fn eventually_within<F>(limit: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn eventually<F>(what: &str, condition: F)
where
    F: FnMut() -> bool,
{
    eventually_within(Duration::from_secs(5), what, condition).await
}

pub fn ids(records: &[NotificationRecord]) -> Vec<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

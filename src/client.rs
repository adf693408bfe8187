//! Notification client facade
//!
//! Binds an identity to a live notification list.
//!
//! ## Architecture
//!
//! ```text
//! Attachment ──► TransportSession ──► SessionEvents ─┐
//!     │                                              ├─► binding driver ──► Store ──► watch<NotificationState>
//!     ├──► NotificationApi (baseline, user actions) ─┤
//!     └──► SignalBus (other origins) ────────────────┘
//! ```
//!
//! An identity is bound by at most one attachment of a client at a time, so a
//! client never holds two physical sessions for the same identity. Further
//! observers follow the owning attachment through the signal bus
//! ([`crate::signal::MirrorView`]).
//!
//! Every binding gets a store generation. Teardown bumps the generation under the
//! store lock before anything else, so work that was started for an older binding
//! can never write into the current state.

use futures_util::future::{BoxFuture, FutureExt, OptionFuture};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{HttpNotificationApi, NotificationApi};
use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::error::NotifyError;
use crate::mutation::{apply, parse_mutation};
use crate::normalize::{merge, normalize, reconcile};
use crate::signal::{apply_signal, NotificationSignal, SignalBus, SignalEvent};
use crate::stomp::{
    ConnectionState, Connector, InboundFrame, SessionConfig, SessionEvent, SessionEvents,
    TransportSession, WebSocketConnector,
};
use crate::subscription::{subscribe, SubscriptionHandle};
use crate::topic::{resolve_with_prefix, Channel};
use crate::types::{Identity, MutationEvent, NotificationRecord, NotificationState};

type Baseline = BoxFuture<'static, Result<Vec<NotificationRecord>, NotifyError>>;

/// Shared by a client and every attachment it creates.
struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    api: Arc<dyn NotificationApi>,
    bus: SignalBus,
    /// Identities currently bound by an attachment of this client
    bound: Mutex<HashSet<Identity>>,
}

impl Shared {
    /// Reserve `identity` for one attachment. False if it is already bound.
    fn claim(&self, identity: &Identity) -> bool {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone())
    }

    fn unclaim(&self, identity: &Identity) {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
    }
}

/// Entry point: creates attachments that share one configuration.
#[derive(Clone)]
pub struct NotificationClient {
    shared: Arc<Shared>,
}

impl NotificationClient {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        api: Arc<dyn NotificationApi>,
    ) -> Self {
        let bus = SignalBus::global_with_capacity(config.signal_capacity).clone();
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                credentials,
                api,
                bus,
                bound: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// WebSocket transport and HTTP API built from `config`.
    pub fn from_config(
        config: ClientConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, NotifyError> {
        config.validate()?;
        let api = HttpNotificationApi::new(
            config.api_url.clone(),
            Arc::clone(&credentials),
            config.request_timeout(),
        )?;
        Ok(Self::new(
            config,
            Arc::new(WebSocketConnector),
            credentials,
            Arc::new(api),
        ))
    }

    /// Use a private signal bus instead of the process-wide one.
    pub fn with_signal_bus(self, bus: SignalBus) -> Self {
        let shared = &self.shared;
        Self {
            shared: Arc::new(Shared {
                config: shared.config.clone(),
                connector: Arc::clone(&shared.connector),
                credentials: Arc::clone(&shared.credentials),
                api: Arc::clone(&shared.api),
                bus,
                bound: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn signal_bus(&self) -> &SignalBus {
        &self.shared.bus
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Bind `identity` to a live notification list. Never fails; problems surface
    /// as `connected = false` and log lines.
    ///
    /// An identity already bound by another attachment of this client is refused
    /// and the new attachment stays idle.
    pub fn attach(&self, identity: Option<Identity>) -> Attachment {
        let (state, _) = watch::channel(NotificationState::default());
        let mut attachment = Attachment {
            shared: Arc::clone(&self.shared),
            store: Arc::new(Store {
                generation: Mutex::new(0),
                state,
            }),
            origin: SignalBus::next_origin(),
            binding: None,
        };
        attachment.bind(identity);
        attachment
    }
}

/// Guarded notification state of one attachment.
struct Store {
    generation: Mutex<u64>,
    state: watch::Sender<NotificationState>,
}

impl Store {
    /// Invalidate every writer and reset the state. Returns the new generation.
    fn begin(&self) -> u64 {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.state.send_if_modified(|state| {
            if *state == NotificationState::default() {
                false
            } else {
                *state = NotificationState::default();
                true
            }
        });
        *generation
    }

    /// Apply `f` if `generation` is still current.
    ///
    /// Returns None for a stale writer, otherwise whether the state changed.
    fn write<F>(&self, generation: u64, f: F) -> Option<bool>
    where
        F: FnOnce(&NotificationState) -> NotificationState,
    {
        let current = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            return None;
        }
        let changed = self.state.send_if_modified(|state| {
            let next = f(state);
            if next == *state {
                false
            } else {
                *state = next;
                true
            }
        });
        Some(changed)
    }

    fn update_records<F>(&self, generation: u64, f: F) -> Option<bool>
    where
        F: FnOnce(&[NotificationRecord]) -> Vec<NotificationRecord>,
    {
        self.write(generation, |state| NotificationState {
            records: f(&state.records),
            connected: state.connected,
        })
    }

    fn set_connected(&self, generation: u64, connected: bool) -> Option<bool> {
        self.write(generation, |state| NotificationState {
            records: state.records.clone(),
            connected,
        })
    }
}

/// Resources held while an identity is bound.
struct Binding {
    identity: Identity,
    generation: u64,
    session: TransportSession,
    subscriptions: SubscriptionHandle,
    driver: JoinHandle<()>,
}

/// A live notification list for at most one identity at a time.
///
/// Dropping the attachment tears everything down.
pub struct Attachment {
    shared: Arc<Shared>,
    store: Arc<Store>,
    origin: u64,
    binding: Option<Binding>,
}

impl Attachment {
    /// Observable state. The receiver stays valid across identity changes.
    pub fn state(&self) -> watch::Receiver<NotificationState> {
        self.store.state.subscribe()
    }

    pub fn snapshot(&self) -> NotificationState {
        self.store.state.borrow().clone()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.binding.as_ref().map(|b| &b.identity)
    }

    /// Connection state of the underlying session, if bound.
    pub fn connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.binding.as_ref().map(|b| b.session.state())
    }

    /// Publisher id used for this attachment's signals.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Switch to another identity (or none). The old binding is fully torn down
    /// first. Setting the current identity again is a no-op.
    pub fn set_identity(&mut self, identity: Option<Identity>) {
        if self.identity() == identity.as_ref() {
            return;
        }
        self.teardown();
        self.bind(identity);
    }

    /// Release subscriptions, close the session and discard state.
    pub fn detach(&mut self) {
        self.teardown();
    }

    pub async fn mark_read(&self, id: &str) -> Result<(), NotifyError> {
        let (identity, generation) = self.current()?;
        self.shared.api.mark_read(&identity, id).await?;
        self.apply_local(&identity, generation, MutationEvent::MarkedRead(id.to_string()));
        Ok(())
    }

    pub async fn mark_all_read(&self) -> Result<(), NotifyError> {
        let (identity, generation) = self.current()?;
        self.shared.api.mark_all_read(&identity).await?;
        self.apply_local(&identity, generation, MutationEvent::MarkedAllRead);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), NotifyError> {
        let (identity, generation) = self.current()?;
        self.shared.api.delete(&identity, id).await?;
        self.apply_local(&identity, generation, MutationEvent::Deleted(id.to_string()));
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<(), NotifyError> {
        let (identity, generation) = self.current()?;
        self.shared.api.delete_all(&identity).await?;
        self.apply_local(&identity, generation, MutationEvent::DeletedAll);
        Ok(())
    }

    /// Re-fetch the baseline and fold it into the current list.
    pub async fn refresh(&self) -> Result<(), NotifyError> {
        let (identity, generation) = self.current()?;
        let baseline = self.shared.api.list(&identity).await?;
        self.store
            .update_records(generation, |list| reconcile(list, baseline));
        Ok(())
    }

    fn current(&self) -> Result<(Identity, u64), NotifyError> {
        self.binding
            .as_ref()
            .map(|b| (b.identity.clone(), b.generation))
            .ok_or(NotifyError::NotAttached)
    }

    fn apply_local(&self, identity: &Identity, generation: u64, event: MutationEvent) {
        if self
            .store
            .update_records(generation, |list| apply(list, &event))
            .is_none()
        {
            debug!(identity = %identity, "Binding changed during request; local update dropped");
            return;
        }
        self.shared.bus.publish(NotificationSignal {
            identity: identity.clone(),
            origin: self.origin,
            event: SignalEvent::Mutation(event),
        });
    }

    fn bind(&mut self, identity: Option<Identity>) {
        let Some(identity) = identity else {
            debug!("No identity; attachment stays idle");
            return;
        };

        if tokio::runtime::Handle::try_current().is_err() {
            error!(
                identity = %identity,
                "No tokio runtime available; notifications stay disconnected"
            );
            return;
        }

        if !self.shared.claim(&identity) {
            error!(
                identity = %identity,
                "Identity already attached on this client; follow that attachment instead"
            );
            return;
        }

        let generation = self.store.begin();
        let config = &self.shared.config;
        let topics = resolve_with_prefix(&config.topic_prefix, &identity);

        let (session, events) = TransportSession::open(
            SessionConfig::from(config),
            Arc::clone(&self.shared.connector),
            Arc::clone(&self.shared.credentials),
        );
        let subscriptions = subscribe(&session, &topics.to_vec());

        let driver = BindingDriver {
            identity: identity.clone(),
            generation,
            origin: self.origin,
            store: Arc::clone(&self.store),
            api: Arc::clone(&self.shared.api),
            bus: self.shared.bus.clone(),
        };
        let signals = self.shared.bus.subscribe();
        let driver = tokio::spawn(driver.run(events, signals));

        info!(identity = %identity, generation = generation, "Attached notification stream");
        self.binding = Some(Binding {
            identity,
            generation,
            session,
            subscriptions,
            driver,
        });
    }

    fn teardown(&mut self) {
        // Invalidate in-flight writers before touching the session
        self.store.begin();

        if let Some(binding) = self.binding.take() {
            binding.subscriptions.release();
            binding.session.close();
            binding.driver.abort();
            self.shared.unclaim(&binding.identity);
            info!(identity = %binding.identity, "Detached notification stream");
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The single writer task of one binding.
struct BindingDriver {
    identity: Identity,
    generation: u64,
    origin: u64,
    store: Arc<Store>,
    api: Arc<dyn NotificationApi>,
    bus: SignalBus,
}

impl BindingDriver {
    async fn run(
        self,
        mut events: SessionEvents,
        mut signals: broadcast::Receiver<NotificationSignal>,
    ) {
        let mut baseline: OptionFuture<Baseline> = Some(self.fetch_baseline()).into();
        let mut bus_open = true;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::State(state)) => {
                        if self.on_state(state) {
                            baseline = Some(self.fetch_baseline()).into();
                        }
                    }
                    Some(SessionEvent::Frame(frame)) => self.on_frame(frame),
                    None => break,
                },

                Some(result) = &mut baseline => {
                    baseline = None.into();
                    self.on_baseline(result);
                }

                signal = signals.recv(), if bus_open => match signal {
                    Ok(signal) => self.on_signal(signal),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            identity = %self.identity,
                            missed = missed,
                            "Signal bus lagged; re-fetching"
                        );
                        baseline = Some(self.fetch_baseline()).into();
                    }
                    Err(broadcast::error::RecvError::Closed) => bus_open = false,
                },
            }
        }

        debug!(identity = %self.identity, "Binding driver stopped");
    }

    fn fetch_baseline(&self) -> Baseline {
        let api = Arc::clone(&self.api);
        let identity = self.identity.clone();
        async move { api.list(&identity).await }.boxed()
    }

    /// Returns true when the baseline should be re-fetched.
    fn on_state(&self, state: ConnectionState) -> bool {
        self.store.set_connected(self.generation, state.is_connected());
        match state {
            ConnectionState::Connected {
                reconnected: true, ..
            } => {
                info!(identity = %self.identity, "Reconnected; refreshing notifications");
                true
            }
            _ => false,
        }
    }

    fn on_frame(&self, frame: InboundFrame) {
        match frame.topic.channel {
            Channel::NewItem => match normalize(&frame.body) {
                Ok(record) => {
                    let changed = self
                        .store
                        .update_records(self.generation, |list| merge(list, record.clone()));
                    if changed == Some(true) {
                        debug!(identity = %self.identity, id = %record.id, "New notification");
                        self.publish(SignalEvent::Received(record));
                    }
                }
                Err(e) => warn!(
                    identity = %self.identity,
                    message_id = ?frame.message_id,
                    error = %e,
                    "Dropping malformed notification"
                ),
            },
            Channel::Mutation => match parse_mutation(&frame.body) {
                Ok(event) => {
                    let applied = self
                        .store
                        .update_records(self.generation, |list| apply(list, &event));
                    if applied.is_some() {
                        debug!(identity = %self.identity, event = ?event, "Applied mutation");
                        self.publish(SignalEvent::Mutation(event));
                    }
                }
                Err(e) => warn!(
                    identity = %self.identity,
                    message_id = ?frame.message_id,
                    error = %e,
                    "Dropping malformed mutation"
                ),
            },
        }
    }

    fn on_baseline(&self, result: Result<Vec<NotificationRecord>, NotifyError>) {
        match result {
            Ok(records) => {
                let count = records.len();
                self.store
                    .update_records(self.generation, |list| reconcile(list, records));
                debug!(identity = %self.identity, count = count, "Baseline loaded");
            }
            Err(e) => warn!(identity = %self.identity, error = %e, "Baseline fetch failed"),
        }
    }

    fn on_signal(&self, signal: NotificationSignal) {
        if signal.origin == self.origin || signal.identity != self.identity {
            return;
        }
        self.store
            .update_records(self.generation, |list| apply_signal(list, &signal.event));
    }

    fn publish(&self, event: SignalEvent) {
        self.bus.publish(NotificationSignal {
            identity: self.identity.clone(),
            origin: self.origin,
            event,
        });
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

    fn store() -> Store {
        let (state, _) = watch::channel(NotificationState::default());
        Store {
            generation: Mutex::new(0),
            state,
        }
    }

    #[test]
    fn test_store_rejects_stale_generation() {
        let store = store();
        let first = store.begin();
        assert_eq!(store.update_records(first, |l| merge(l, rec("a"))), Some(true));

        let second = store.begin();
        assert!(store.state.borrow().records.is_empty());
        assert_eq!(store.update_records(first, |l| merge(l, rec("b"))), None);
        assert!(store.state.borrow().records.is_empty());
        assert_eq!(store.update_records(second, |l| merge(l, rec("c"))), Some(true));
    }

    #[test]
    fn test_store_reports_unchanged() {
        let store = store();
        let generation = store.begin();
        store.update_records(generation, |l| merge(l, rec("a")));
        assert_eq!(store.update_records(generation, |l| merge(l, rec("a"))), Some(false));
        assert_eq!(store.set_connected(generation, true), Some(true));
        assert_eq!(store.set_connected(generation, true), Some(false));
    }

    #[test]
    fn test_attach_without_runtime_stays_idle() {
        let client = NotificationClient::from_config(
            ClientConfig::default(),
            Arc::new(crate::credentials::Anonymous),
        )
        .unwrap()
        .with_signal_bus(SignalBus::new(8));

        let attachment = client.attach(Some(Identity::customer("u1")));
        assert!(attachment.identity().is_none());
        assert_eq!(attachment.snapshot(), NotificationState::default());
    }

    #[test]
    fn test_identity_claim_is_exclusive() {
        let client = NotificationClient::from_config(
            ClientConfig::default(),
            Arc::new(crate::credentials::Anonymous),
        )
        .unwrap();
        let u1 = Identity::customer("u1");

        assert!(client.shared.claim(&u1));
        assert!(!client.shared.claim(&u1));
        // Same raw id, other kind
        assert!(client.shared.claim(&Identity::shop("u1")));

        client.shared.unclaim(&u1);
        assert!(client.shared.claim(&u1));
    }

    #[tokio::test]
    async fn test_actions_require_identity() {
        let client = NotificationClient::from_config(
            ClientConfig::default(),
            Arc::new(crate::credentials::Anonymous),
        )
        .unwrap()
        .with_signal_bus(SignalBus::new(8));

        let attachment = client.attach(None);
        assert!(matches!(attachment.mark_read("n1").await, Err(NotifyError::NotAttached)));
        assert!(matches!(attachment.refresh().await, Err(NotifyError::NotAttached)));
        assert!(matches!(attachment.delete_all().await, Err(NotifyError::NotAttached)));
    }
}

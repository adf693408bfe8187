//! Notification Client - Real-time notifications for customers and shops
//!
//! Keeps a live, deduplicated notification list for one identity over a STOMP
//! WebSocket session, with a REST baseline and in-process fan-out.
//!
//! ## Architecture
//!
//! ```text
//! Identity ──► Topic Resolver ──► TransportSession (STOMP/WebSocket, heartbeats, reconnect)
//!                                        │
//!                                        ├─ new-item ─► normalize + merge ──┐
//!                                        └─ mutation ─► parse + apply ──────┤
//!                                                                           ▼
//!                       REST baseline ─► reconcile ─────────────► watch<NotificationState>
//!                                                                           │
//!                                                                 SignalBus ─► MirrorView
//! ```
//!
//! ## Topics
//!
//! | Identity kind | New items          | Mutations                  |
//! |---------------|--------------------|----------------------------|
//! | Customer      | `/topic/user/{id}` | `/topic/user/{id}/updates` |
//! | Shop          | `/topic/shop/{id}` | `/topic/shop/{id}/updates` |

pub mod api;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod mutation;
pub mod normalize;
pub mod signal;
pub mod stomp;
pub mod subscription;
pub mod topic;
pub mod types;

pub use api::{HttpNotificationApi, NotificationApi};
pub use client::{Attachment, NotificationClient};
pub use config::ClientConfig;
pub use credentials::{Anonymous, CredentialProvider, EnvToken, StaticToken};
pub use error::{FrameError, NotifyError};
pub use mutation::{apply, parse_mutation};
pub use normalize::{merge, normalize, reconcile};
pub use signal::{MirrorView, NotificationSignal, SignalBus, SignalEvent};
pub use stomp::{
    ConnectionState, Connector, Duplex, SessionConfig, TransportSession, WebSocketConnector,
};
pub use subscription::{subscribe, SubscriptionHandle};
pub use topic::{resolve, resolve_with_prefix, Channel, Topic, TopicPair};
pub use types::{
    Identity, IdentityKind, MutationEvent, NotificationPayload, NotificationRecord,
    NotificationState,
};

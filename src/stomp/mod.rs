//! STOMP-over-WebSocket Session Module
//!
//! Keeps one authenticated broker connection alive for a notification binding.
//!
//! # Architecture
//!
//! | Module      | Responsibility                                       |
//! |-------------|------------------------------------------------------|
//! | `transport` | Duplex connect/send/receive (WebSocket or in-memory) |
//! | `protocol`  | STOMP 1.2 frame encoding, heart-beat negotiation     |
//! | `session`   | Connection lifecycle, heartbeats, reconnection       |
//!
//! # Key Design Principles
//!
//! ## 1. One Owner Per Connection
//!
//! - A spawned driver owns the stream and the subscription table
//! - Handles talk to it over channels
//! - The session reports state changes and routed frames on one ordered stream
//!
//! ## 2. Closed Is Terminal
//!
//! - `close()` wins over any in-flight reconnect
//! - After `Closed` no further state changes or frames are emitted
//!
//! ## 3. Reconnect Means Resubscribe
//!
//! - Broker subscriptions are tied to one physical connection
//! - Every new connection gets a fresh id and every desired topic is subscribed
//!   again exactly once on it
//!
//! # Usage
//!
//! ```ignore
//! use notification_client::stomp::{SessionConfig, TransportSession, WebSocketConnector};
//!
//! let (session, mut events) = TransportSession::open(
//!     SessionConfig::default(),
//!     Arc::new(WebSocketConnector),
//!     Arc::new(StaticToken::new(token)),
//! );
//! let _subs = subscription::subscribe(&session, &resolve(&identity).to_vec());
//!
//! while let Some(event) = events.recv().await {
//!     // ...
//! }
//! ```

pub mod protocol;
pub mod session;
pub mod transport;

pub use protocol::{Command, Frame, HeartBeat, Inbound};
pub use session::{
    ConnectionState, InboundFrame, SessionConfig, SessionEvent, SessionEvents, TransportSession,
};
pub use transport::{Connector, Duplex, WebSocketConnector};

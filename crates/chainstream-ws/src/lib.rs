//! chainstream-ws — event-stream client for CometBFT / Tendermint nodes.
//!
//! # Features
//! - Auto-reconnect with capped exponential backoff and a failure budget
//! - Heartbeat probing to catch connections that hang without closing
//! - Local subscription ids, callback fan-out per query
//! - Re-subscription of every live query after a reconnect
//! - Request/response calls multiplexed over the same connection

pub mod client;
pub mod config;
mod controller;
mod dispatcher;
pub mod heartbeat;
pub mod state;
pub mod subscriptions;
pub mod transport;

pub use client::StreamClient;
pub use config::{websocket_url, StreamClientConfig};
pub use heartbeat::HeartbeatConfig;
pub use state::{ConnectionState, Termination};
pub use subscriptions::{EventCallback, Notification, SubscriptionHandle, SubscriptionRegistry};
pub use transport::WsTransport;

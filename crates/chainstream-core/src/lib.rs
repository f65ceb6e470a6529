//! chainstream-core — foundation types for the ChainStream event client.
//!
//! # Overview
//!
//! ChainStream keeps a persistent JSON-RPC subscription stream open against a
//! CometBFT / Tendermint node. The core crate holds the parts that carry no
//! connection state:
//!
//! - [`Envelope`] / [`JsonRpcRequest`] — the wire codec
//! - [`DecodedEvent`] — typed events built from push payloads
//! - [`SubscriptionId`] — locally generated subscription ids
//! - [`Transport`] — the connection abstraction the client drives
//! - [`policy`] module — reconnect backoff
//! - [`Query`] — event query builder
//! - [`StreamError`] and friends — the error taxonomy

pub mod envelope;
pub mod error;
pub mod event;
pub mod id;
pub mod policy;
pub mod query;
pub mod transport;

pub use envelope::{Envelope, JsonRpcError, JsonRpcRequest, Push, RpcId};
pub use error::{CloseReason, ProtocolError, StreamError, SubscriptionError, TransportError};
pub use event::{AttributeEncoding, DecodedEvent};
pub use id::SubscriptionId;
pub use policy::{ReconnectConfig, ReconnectPolicy, ReconnectState};
pub use query::Query;
pub use transport::{Connection, FrameSender, InboundFrame, OutboundFrame, PeerEnd, Transport};

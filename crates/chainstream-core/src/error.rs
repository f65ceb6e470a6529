//! Error taxonomy for the event-stream client.
//!
//! - [`TransportError`]: connection-level, always recovered by reconnecting
//! - [`ProtocolError`]: a malformed frame, logged and dropped
//! - [`SubscriptionError`]: surfaced to the callbacks of the affected scope
//! - [`StreamError`]: what calling code sees

use thiserror::Error;

use crate::envelope::JsonRpcError;

/// Why a transport connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("network reset: {0}")]
    NetworkReset(String),

    #[error("timed out")]
    Timeout,

    #[error("closed locally")]
    ExplicitClose,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Errors raised by a [`Transport`](crate::transport::Transport) or while
/// keeping one alive.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A send was attempted on a connection that is not open.
    #[error("not connected")]
    NotConnected,

    /// Opening the connection failed.
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    /// WebSocket send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer or the network ended the connection.
    #[error("connection closed: {0}")]
    Closed(CloseReason),

    /// The connection dropped while a request was in flight.
    #[error("connection reset before a response arrived")]
    ConnectionReset,

    /// No liveness signal arrived in time after a ping.
    #[error("no liveness signal within {ms}ms of a ping")]
    HeartbeatTimeout { ms: u64 },

    /// The endpoint could not be turned into a WebSocket URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Returns `true` if reconnecting can recover from this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidEndpoint(_))
    }
}

/// A frame that could not be decoded into a known envelope shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("unsupported jsonrpc version {0:?}")]
    UnsupportedVersion(String),

    #[error("result frame carries no id")]
    MissingId,

    #[error("frame has neither result nor error")]
    UnknownShape,

    #[error("invalid error object: {0}")]
    InvalidError(String),

    #[error("invalid event attribute: {0}")]
    InvalidAttribute(String),

    #[error("invalid number in {field}: {value:?}")]
    InvalidNumber { field: String, value: String },
}

/// Terminal errors delivered to subscription callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The server refused the subscribe request for this query.
    #[error("subscription to {query:?} rejected ({code}): {message}")]
    Rejected {
        query: String,
        code: i64,
        message: String,
    },

    /// The reconnect budget ran out; the client is closed.
    #[error("connection permanently lost after {attempts} failed reconnect attempts")]
    PermanentFailure { attempts: u32 },
}

/// Errors returned to callers of the stream client.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// JSON-RPC error returned by the node for a call.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("invalid query: {0:?}")]
    InvalidQuery(String),

    /// The client has been closed.
    #[error("client is closed")]
    Closed,

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl StreamError {
    /// Returns `true` if the failure ended the client for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Subscription(SubscriptionError::PermanentFailure { .. })
        )
    }
}

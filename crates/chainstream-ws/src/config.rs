//! Client configuration and endpoint normalisation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use chainstream_core::error::TransportError;
use chainstream_core::{AttributeEncoding, ReconnectConfig};

use crate::heartbeat::HeartbeatConfig;

/// Fixed path of a node's event-stream endpoint.
pub const WEBSOCKET_PATH: &str = "/websocket";

/// Configuration for a [`StreamClient`](crate::StreamClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClientConfig {
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Time between liveness pings.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long after a ping the connection may stay silent.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Upper bound on opening one WebSocket connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound on a single `call`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How event attribute keys and values arrive on the wire.
    #[serde(default)]
    pub attribute_encoding: AttributeEncoding,
    /// Frame buffer between the transport and the controller.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_heartbeat_interval_ms() -> u64 { 30_000 }
fn default_heartbeat_timeout_ms() -> u64 { 10_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_channel_capacity() -> usize { 256 }

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            attribute_encoding: AttributeEncoding::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamClientConfig {
    /// Parse a config from JSON; absent fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Turn a node address into its WebSocket event endpoint.
///
/// `http` becomes `ws` and `https` becomes `wss`; the `/websocket` path is
/// appended unless already present.
///
/// ```
/// use chainstream_ws::config::websocket_url;
///
/// assert_eq!(
///     websocket_url("https://rpc.example.com:443").unwrap(),
///     "wss://rpc.example.com/websocket"
/// );
/// ```
pub fn websocket_url(endpoint: &str) -> Result<String, TransportError> {
    let mut url = Url::parse(endpoint.trim())
        .map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "{endpoint}: unsupported scheme {other}"
            )))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }
    if url.host_str().is_none() {
        return Err(TransportError::InvalidEndpoint(format!("{endpoint}: missing host")));
    }

    let path = url.path().trim_end_matches('/');
    if !path.ends_with(WEBSOCKET_PATH) {
        let joined = format!("{path}{WEBSOCKET_PATH}");
        url.set_path(&joined);
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = StreamClientConfig::default();
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.reconnect.multiplier, 2);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.heartbeat(), HeartbeatConfig::default());
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.attribute_encoding, AttributeEncoding::Base64);
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = StreamClientConfig::from_json(
            r#"{"reconnect": {"max_attempts": 8}, "attribute_encoding": "plain"}"#,
        )
        .unwrap();
        assert_eq!(config.reconnect.max_attempts, 8);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.attribute_encoding, AttributeEncoding::Plain);
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn connect_timeout_is_configurable() {
        let config = StreamClientConfig::from_json(r#"{"connect_timeout_ms": 2500}"#).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(2_500));
    }

    #[test]
    fn empty_json_is_default() {
        assert_eq!(
            StreamClientConfig::from_json("{}").unwrap(),
            StreamClientConfig::default()
        );
    }

    #[test]
    fn http_schemes_are_upgraded() {
        assert_eq!(
            websocket_url("http://localhost:26657").unwrap(),
            "ws://localhost:26657/websocket"
        );
        assert_eq!(
            websocket_url("https://rpc.node.io").unwrap(),
            "wss://rpc.node.io/websocket"
        );
    }

    #[test]
    fn existing_websocket_path_is_kept() {
        assert_eq!(
            websocket_url("ws://localhost:26657/websocket").unwrap(),
            "ws://localhost:26657/websocket"
        );
        assert_eq!(
            websocket_url("wss://node.io/rpc/").unwrap(),
            "wss://node.io/rpc/websocket"
        );
    }

    #[test]
    fn bad_endpoints_are_rejected() {
        for bad in ["ftp://node.io", "not a url", ""] {
            assert!(
                matches!(websocket_url(bad), Err(TransportError::InvalidEndpoint(_))),
                "{bad} should be rejected"
            );
        }
    }
}

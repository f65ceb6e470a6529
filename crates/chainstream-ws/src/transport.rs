//! `WsTransport` — tokio-tungstenite implementation of [`Transport`].
//!
//! Each `open` spawns a pump task that owns the socket, drains outbound
//! frames onto it and forwards inbound messages. Server pings are answered
//! here and reported upward as liveness.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chainstream_core::error::{CloseReason, TransportError};
use chainstream_core::transport::{Connection, InboundFrame, OutboundFrame, PeerEnd, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsTransport {
    capacity: usize,
    connect_timeout: Duration,
}

impl WsTransport {
    /// `capacity` frames are buffered in each direction.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let connect_failed = |reason: String| TransportError::ConnectFailed {
            url: endpoint.to_string(),
            reason,
        };

        let (ws, _response) = time::timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| connect_failed(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| connect_failed(e.to_string()))?;

        tracing::debug!(endpoint = %endpoint, "websocket open");
        let (connection, peer) = Connection::pair(self.capacity);
        tokio::spawn(pump(ws, peer, endpoint.to_string()));
        Ok(connection)
    }
}

async fn pump(ws: WsStream, mut peer: PeerEnd, endpoint: String) {
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            frame = peer.outbound.recv() => {
                let message = match frame {
                    Some(OutboundFrame::Text(text)) => Message::Text(text),
                    Some(OutboundFrame::Ping) => Message::Ping(Vec::new()),
                    None => break CloseReason::ExplicitClose,
                };
                if let Err(e) = sink.send(message).await {
                    break CloseReason::NetworkReset(e.to_string());
                }
            }
            message = stream.next() => {
                let inbound = match message {
                    Some(Ok(Message::Text(text))) => InboundFrame::Data(Bytes::from(text)),
                    Some(Ok(Message::Binary(data))) => InboundFrame::Data(Bytes::from(data)),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            break CloseReason::NetworkReset(e.to_string());
                        }
                        InboundFrame::Pong
                    }
                    Some(Ok(Message::Pong(_))) => InboundFrame::Pong,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by peer".to_string(),
                            |f| format!("closed by peer: {} {}", f.code, f.reason),
                        );
                        break CloseReason::NetworkReset(reason);
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) => break CloseReason::NetworkReset(e.to_string()),
                    None => break CloseReason::NetworkReset("stream ended".into()),
                };
                if peer.inbound.send(inbound).await.is_err() {
                    break CloseReason::ExplicitClose;
                }
            }
        }
    };

    if reason == CloseReason::ExplicitClose {
        let _ = sink.close().await;
    }
    tracing::debug!(endpoint = %endpoint, reason = %reason, "websocket pump stopped");
    let _ = peer.inbound.send(InboundFrame::Closed(reason)).await;
}

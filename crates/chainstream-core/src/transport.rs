//! The `Transport` trait — one physical connection to one endpoint.
//!
//! A transport knows nothing about JSON-RPC. It opens a [`Connection`]: a
//! [`FrameSender`] for outbound frames and a receiver of [`InboundFrame`]s
//! that ends with a single [`InboundFrame::Closed`]. Sends never buffer for
//! retry; once the connection is gone they fail with
//! [`TransportError::NotConnected`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::error::{CloseReason, TransportError};

/// A frame headed for the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Liveness ping.
    Ping,
}

/// A frame or signal arriving from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Data(Bytes),
    /// Transport-level liveness signal (a pong, or a ping from the peer).
    Pong,
    /// Terminal. Nothing follows it.
    Closed(CloseReason),
}

/// Cloneable write half of a [`Connection`].
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<OutboundFrame>,
}

impl FrameSender {
    /// Hand a frame to the transport, waiting for buffer space if needed.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send(OutboundFrame::Text(text)).await
    }

    /// Hand a frame to the transport, giving up if the buffer stays full for
    /// `timeout`. A stalled buffer means nothing is draining the connection,
    /// reported as [`CloseReason::Timeout`].
    pub async fn send_within(&self, frame: OutboundFrame, timeout: Duration) -> Result<(), TransportError> {
        self.tx.send_timeout(frame, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => TransportError::Closed(CloseReason::Timeout),
            SendTimeoutError::Closed(_) => TransportError::NotConnected,
        })
    }

    /// Returns `true` once the transport side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open connection as seen by the client.
#[derive(Debug)]
pub struct Connection {
    pub sender: FrameSender,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// The transport's end of a [`Connection`]: it drains `outbound` onto the
/// network and feeds `inbound` from it.
#[derive(Debug)]
pub struct PeerEnd {
    pub outbound: mpsc::Receiver<OutboundFrame>,
    pub inbound: mpsc::Sender<InboundFrame>,
}

impl Connection {
    /// Build both ends of a connection with `capacity` frames of buffer in
    /// each direction.
    pub fn pair(capacity: usize) -> (Connection, PeerEnd) {
        let capacity = capacity.max(1);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Connection {
                sender: FrameSender { tx: out_tx },
                inbound: in_rx,
            },
            PeerEnd {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

/// Opens connections to an endpoint.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the client keeps one as
/// `Arc<dyn Transport>` for its whole lifetime and calls `open` once per
/// connection attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection to `endpoint`.
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError>;
}

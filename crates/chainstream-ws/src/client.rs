//! Event-stream client with heartbeat, auto-reconnect and re-subscription.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use chainstream_core::error::{StreamError, SubscriptionError, TransportError};
use chainstream_core::transport::Transport;
use chainstream_core::{DecodedEvent, Query};

use crate::config::{websocket_url, StreamClientConfig};
use crate::controller::{Command, Controller};
use crate::state::{ClientState, ConnectionState, Termination};
use crate::subscriptions::{Notification, SubscriptionHandle, SubscriptionRegistry};
use crate::transport::WsTransport;

/// Client for a node's event stream.
///
/// Owns a background task that keeps one connection open, replays every
/// subscription after a reconnect and gives up after the configured number
/// of consecutive failed connection attempts. Dropping the client closes it.
///
/// ```no_run
/// use chainstream_ws::{Notification, StreamClient, StreamClientConfig};
///
/// # async fn run() -> Result<(), chainstream_core::StreamError> {
/// let client = StreamClient::connect("https://rpc.example.com", StreamClientConfig::default()).await?;
/// let _handle = client.subscribe("tm.event='Tx'", |n: &Notification| {
///     if let Notification::Event(event) = n {
///         println!("{} {:?}", event.kind, event.attributes);
///     }
/// })?;
/// client.wait_connected().await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamClient {
    endpoint: String,
    config: StreamClientConfig,
    state: Arc<ClientState>,
    registry: SubscriptionRegistry,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// Connect to a node over WebSocket and start the background task.
    ///
    /// `endpoint` may be an `http(s)` or `ws(s)` address; it is normalised
    /// with [`websocket_url`]. Returns before the first connection is up,
    /// see [`wait_connected`](Self::wait_connected).
    pub async fn connect(endpoint: &str, config: StreamClientConfig) -> Result<Self, StreamError> {
        let url = websocket_url(endpoint)?;
        let transport = WsTransport::new(config.channel_capacity).with_connect_timeout(config.connect_timeout());
        Self::connect_with(url, config, Arc::new(transport)).await
    }

    /// Start a client on a caller-supplied transport. `endpoint` is handed to
    /// the transport unchanged.
    pub async fn connect_with(
        endpoint: impl Into<String>,
        config: StreamClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, StreamError> {
        let endpoint = endpoint.into();
        let state = ClientState::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let registry = SubscriptionRegistry::new(Arc::clone(&state), commands.clone());

        let controller = Controller::new(
            endpoint.clone(),
            transport,
            Arc::clone(&state),
            registry.clone(),
            command_rx,
            &config,
        );
        let task = tokio::spawn(controller.run());

        Ok(Self {
            endpoint,
            config,
            state,
            registry,
            commands,
            task: Mutex::new(Some(task)),
        })
    }

    /// Subscribe `callback` to events matching `query`.
    ///
    /// Returns as soon as the subscription is registered; the wire request
    /// goes out now if connected, otherwise on the next connect.
    pub fn subscribe<F>(&self, query: impl Into<String>, callback: F) -> Result<SubscriptionHandle, StreamError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.registry.subscribe(query, Arc::new(callback))
    }

    /// Subscribe with notifications delivered on a channel.
    pub fn subscribe_channel(
        &self,
        query: impl Into<String>,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Notification>), StreamError> {
        self.registry.subscribe_channel(query)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        handle.unsubscribe()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Send a JSON-RPC request over the stream connection and decode its
    /// result.
    ///
    /// Fails immediately unless connected; calls are never queued across a
    /// reconnect. A call that times out is forgotten, and a late reply to it
    /// is dropped.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, StreamError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(self.terminal_error()),
            _ => return Err(TransportError::NotConnected.into()),
        }

        let id = self.state.next_request_id();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                id: id.clone(),
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| StreamError::Closed)?;

        let timeout = self.config.request_timeout();
        let outcome = time::timeout(timeout, rx).await;
        let value = match outcome {
            Err(_) => {
                // The receiver is gone, so the controller will not track the
                // call if it has not already.
                self.state.resolve(&id);
                tracing::debug!(method = %method, id = %id, "call timed out");
                return Err(StreamError::Timeout {
                    ms: timeout.as_millis() as u64,
                });
            }
            Ok(Err(_)) => return Err(StreamError::Closed),
            Ok(Ok(result)) => result?,
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Wait for the transaction with `hash` to be committed and return its
    /// result event.
    pub async fn wait_for_tx(&self, hash: &str, timeout: Duration) -> Result<DecodedEvent, StreamError> {
        let query = Query::tx_hash(hash);
        let (handle, mut rx) = self.registry.subscribe_channel(query)?;
        tracing::debug!(hash = %hash, "waiting for transaction");

        let outcome = time::timeout(timeout, rx.recv()).await;
        handle.unsubscribe();

        match outcome {
            Err(_) => Err(StreamError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
            Ok(Some(Notification::Event(event))) => Ok(event),
            Ok(Some(Notification::Error(e))) => Err(e.into()),
            Ok(None) => Err(self.terminal_error()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch_state()
    }

    /// Resolve once connected, or fail if the client reaches `Closed` first.
    pub async fn wait_connected(&self) -> Result<(), StreamError> {
        let mut states = self.state.watch_state();
        loop {
            let current = *states.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(self.terminal_error()),
                _ => {}
            }
            if states.changed().await.is_err() {
                return Err(StreamError::Closed);
            }
        }
    }

    /// How the client ended, if it has.
    pub fn termination(&self) -> Option<Termination> {
        self.state.watch_termination().borrow().clone()
    }

    /// Resolve when the client reaches `Closed`.
    pub async fn terminated(&self) -> Termination {
        let mut termination = self.state.watch_termination();
        loop {
            if let Some(t) = termination.borrow_and_update().clone() {
                return t;
            }
            if termination.changed().await.is_err() {
                return Termination::Closed;
            }
        }
    }

    /// In-flight requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.state.pending_len()
    }

    /// Close the client. Clears every subscription without notifying it,
    /// fails in-flight calls and stops the background task. Idempotent.
    pub fn close(&self) {
        if self.state.finish(Termination::Closed).is_some() {
            tracing::info!(endpoint = %self.endpoint, "client closed");
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &StreamClientConfig {
        &self.config
    }

    fn terminal_error(&self) -> StreamError {
        match self.termination() {
            Some(Termination::PermanentFailure { attempts }) => {
                SubscriptionError::PermanentFailure { attempts }.into()
            }
            _ => StreamError::Closed,
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}

//! Reconnection controller: the background task that owns the connection.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Connected ─▶ Reconnecting ─▶ Connecting ─▶ …
//!                     │                            │
//!                     └──── budget exhausted ──────┴─▶ Closed
//! ```
//!
//! Only this task moves the state machine forward; `close()` is the one
//! outside writer and only ever moves it to `Closed`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use chainstream_core::envelope::{Envelope, JsonRpcError, JsonRpcRequest};
use chainstream_core::error::{CloseReason, StreamError, SubscriptionError, TransportError};
use chainstream_core::transport::{Connection, FrameSender, InboundFrame, OutboundFrame, Transport};
use chainstream_core::{ReconnectPolicy, ReconnectState, RpcId, SubscriptionId};

use crate::config::StreamClientConfig;
use crate::dispatcher::{deliver, Dispatcher};
use crate::heartbeat::{run_heartbeat, HeartbeatConfig, HeartbeatOutcome, Liveness};
use crate::state::{ClientState, ConnectionState, PendingKind, Termination};
use crate::subscriptions::{Notification, SubscriptionRegistry};

/// Work handed to the controller by the registry and the client façade.
pub(crate) enum Command {
    /// A new subscription was created while connected.
    Subscribe { query: String },
    /// The last callback for `query` went away on connection `epoch`.
    Unsubscribe { query: String, epoch: u64 },
    Call {
        id: RpcId,
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, StreamError>>,
    },
}

/// Why a connection stopped being served.
enum Disconnect {
    Lost(TransportError),
    Shutdown,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct Controller {
    endpoint: String,
    transport: Arc<dyn Transport>,
    state: Arc<ClientState>,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    policy: ReconnectPolicy,
    backoff: ReconnectState,
    heartbeat: HeartbeatConfig,
    epoch: u64,
}

impl Controller {
    pub fn new(
        endpoint: String,
        transport: Arc<dyn Transport>,
        state: Arc<ClientState>,
        registry: SubscriptionRegistry,
        commands: mpsc::UnboundedReceiver<Command>,
        config: &StreamClientConfig,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        let backoff = ReconnectState::new(&policy);
        Self {
            endpoint,
            transport,
            state,
            dispatcher: Dispatcher::new(registry.clone(), config.attribute_encoding),
            registry,
            commands,
            policy,
            backoff,
            heartbeat: config.heartbeat(),
            epoch: 0,
        }
    }

    /// Drive the connection until the client closes or the reconnect budget
    /// runs out.
    pub async fn run(mut self) {
        loop {
            if !self.state.transition(ConnectionState::Connecting) {
                return;
            }
            tracing::info!(
                endpoint = %self.endpoint,
                attempt = self.backoff.attempt,
                "connecting"
            );

            match self.transport.open(&self.endpoint).await {
                Ok(connection) => {
                    self.backoff.reset(&self.policy);
                    match self.serve(connection).await {
                        Disconnect::Shutdown => return,
                        Disconnect::Lost(error) => {
                            tracing::warn!(endpoint = %self.endpoint, error = %error, "connection lost");
                            if !self.state.enter_reconnecting() {
                                return;
                            }
                        }
                    }
                }
                Err(error) => {
                    self.backoff.record_failure(&self.policy);
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        attempt = self.backoff.attempt,
                        error = %error,
                        "connect failed"
                    );
                    if !error.is_retryable() || self.policy.is_exhausted(self.backoff.attempt) {
                        self.fail_permanently();
                        return;
                    }
                    if !self.state.transition(ConnectionState::Reconnecting) {
                        return;
                    }
                }
            }

            if !self.wait(self.backoff.next_delay).await {
                return;
            }
        }
    }

    /// Serve one open connection until it ends.
    async fn serve(&mut self, connection: Connection) -> Disconnect {
        let Connection {
            sender,
            mut inbound,
        } = connection;

        let Some((epoch, replay)) = self.state.enter_connected() else {
            return Disconnect::Shutdown;
        };
        self.epoch = epoch;
        tracing::info!(
            endpoint = %self.endpoint,
            subscriptions = replay.len(),
            "connected"
        );

        let liveness = Arc::new(Liveness::new());
        let mut heartbeat = AbortOnDrop(tokio::spawn(run_heartbeat(
            Arc::clone(&liveness),
            sender.clone(),
            self.heartbeat,
        )));

        for (query, id) in replay {
            if let Err(error) = self.send_subscribe(&sender, query, id).await {
                return Disconnect::Lost(error);
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Disconnect::Shutdown;
                    };
                    if let Err(error) = self.handle_command(&sender, command).await {
                        return Disconnect::Lost(error);
                    }
                }
                frame = inbound.recv() => match frame {
                    Some(InboundFrame::Data(bytes)) => {
                        liveness.touch();
                        self.handle_frame(&bytes);
                    }
                    Some(InboundFrame::Pong) => liveness.touch(),
                    Some(InboundFrame::Closed(reason)) => {
                        return Disconnect::Lost(TransportError::Closed(reason));
                    }
                    None => {
                        return Disconnect::Lost(TransportError::Closed(CloseReason::NetworkReset(
                            "transport went away".into(),
                        )));
                    }
                },
                outcome = &mut heartbeat.0 => {
                    return Disconnect::Lost(match outcome {
                        Ok(HeartbeatOutcome::Dead { timeout }) => TransportError::HeartbeatTimeout {
                            ms: timeout.as_millis() as u64,
                        },
                        Ok(HeartbeatOutcome::TransportGone) | Err(_) => TransportError::NotConnected,
                    });
                }
            }
        }
    }

    /// Sleep out the backoff delay. Returns `false` if the client closed.
    async fn wait(&mut self, delay: Duration) -> bool {
        tracing::info!(
            endpoint = %self.endpoint,
            attempt = self.backoff.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    return self.state.connection_state() != ConnectionState::Closed;
                }
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Call { reply, .. }) => {
                        let _ = reply.send(Err(TransportError::NotConnected.into()));
                    }
                    // Subscriptions are replayed from the registry on connect.
                    Some(Command::Subscribe { .. } | Command::Unsubscribe { .. }) => {}
                },
            }
        }
    }

    async fn handle_command(
        &mut self,
        sender: &FrameSender,
        command: Command,
    ) -> Result<(), TransportError> {
        match command {
            Command::Subscribe { query } => match self.registry.take_unsent(&query) {
                Some(id) => self.send_subscribe(sender, query, id).await,
                None => Ok(()),
            },
            Command::Unsubscribe { query, epoch } => {
                if epoch != self.epoch {
                    tracing::trace!(query = %query, "dropping unsubscribe from an earlier connection");
                    return Ok(());
                }
                let id = self.state.next_request_id();
                let request = JsonRpcRequest::unsubscribe(id.clone(), &query);
                tracing::debug!(query = %query, "unsubscribing");
                self.state.track(id, PendingKind::Unsubscribe { query });
                self.send(sender, &request).await
            }
            Command::Call {
                id,
                method,
                params,
                reply,
            } => {
                let frame = match JsonRpcRequest::new(id.clone(), method, params).to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        return Ok(());
                    }
                };
                if !self.state.track(id, PendingKind::Call(reply)) {
                    return Ok(());
                }
                self.send_frame(sender, frame).await
            }
        }
    }

    async fn send_subscribe(
        &mut self,
        sender: &FrameSender,
        query: String,
        id: SubscriptionId,
    ) -> Result<(), TransportError> {
        let request = JsonRpcRequest::subscribe(&id, &query);
        tracing::debug!(query = %query, subscription_id = %id, "subscribing");
        self.state
            .track(RpcId::from(&id), PendingKind::Subscribe { query, id });
        self.send(sender, &request).await
    }

    async fn send(
        &self,
        sender: &FrameSender,
        request: &JsonRpcRequest,
    ) -> Result<(), TransportError> {
        match request.to_frame() {
            Ok(frame) => self.send_frame(sender, frame).await,
            Err(e) => {
                tracing::warn!(method = %request.method, error = %e, "failed to encode request");
                Ok(())
            }
        }
    }

    /// Outbound sends share the heartbeat's deadline so a connection that
    /// stopped draining is dropped instead of parking the controller.
    async fn send_frame(&self, sender: &FrameSender, frame: String) -> Result<(), TransportError> {
        sender
            .send_within(OutboundFrame::Text(frame), self.heartbeat.timeout)
            .await
    }

    fn handle_frame(&self, frame: &[u8]) {
        match Envelope::decode(frame) {
            Envelope::Push(push) => {
                self.dispatcher.dispatch(push);
            }
            Envelope::Result { id, payload } => self.resolve(id, Ok(payload)),
            Envelope::ErrorReply { id, error } => self.resolve(id, Err(error)),
            Envelope::Malformed(error) => self.dispatcher.discard(&error),
        }
    }

    fn resolve(&self, id: RpcId, outcome: Result<Value, JsonRpcError>) {
        let Some(request) = self.state.resolve(&id) else {
            tracing::debug!(id = %id, "response for unknown request");
            return;
        };
        let latency_ms = request.sent_at.elapsed().as_millis() as u64;

        match request.kind {
            PendingKind::Call(reply) => {
                tracing::trace!(id = %id, latency_ms, "call completed");
                let _ = reply.send(outcome.map_err(StreamError::Rpc));
            }
            PendingKind::Subscribe { query, id } => match outcome {
                Ok(_) => {
                    if self.registry.confirm(&query, &id) {
                        tracing::debug!(query = %query, subscription_id = %id, latency_ms, "subscription confirmed");
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        query = %query,
                        subscription_id = %id,
                        code = error.code,
                        error = %error.message,
                        "subscription rejected"
                    );
                    if let Some(callbacks) = self.registry.reject(&query, &id) {
                        let notification = Notification::Error(SubscriptionError::Rejected {
                            query,
                            code: error.code,
                            message: error.message,
                        });
                        deliver(&callbacks, &notification);
                    }
                }
            },
            PendingKind::Unsubscribe { query } => match outcome {
                Ok(_) => tracing::debug!(query = %query, "unsubscribed"),
                Err(error) => {
                    tracing::debug!(query = %query, error = %error.message, "unsubscribe refused")
                }
            },
        }
    }

    fn fail_permanently(&self) {
        let attempts = self.backoff.attempt;
        tracing::error!(endpoint = %self.endpoint, attempts, "reconnect attempts exhausted");
        if let Some(callbacks) = self.state.finish(Termination::PermanentFailure { attempts }) {
            let notification = Notification::Error(SubscriptionError::PermanentFailure { attempts });
            deliver(&callbacks, &notification);
        }
    }
}

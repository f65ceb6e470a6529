//! State shared by the controller, the registry and the dispatcher.
//!
//! One `ClientState` exists per client and is handed to every component
//! explicitly. The connection state, the subscription map and the pending
//! request table sit behind a single mutex; every operation on them is short
//! and never awaits, and callbacks are always invoked after the guard drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use chainstream_core::error::{StreamError, SubscriptionError, TransportError};
use chainstream_core::{RpcId, SubscriptionId};

use crate::subscriptions::EventCallback;

/// Lifecycle of the client's single upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// How a client reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// `close()` was called or the client was dropped.
    Closed,
    /// The reconnect budget ran out.
    PermanentFailure { attempts: u32 },
}

/// Whether a subscription is registered on the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireStatus {
    Unsent,
    Pending,
    Confirmed,
}

pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub wire: WireStatus,
    pub callbacks: Vec<(u64, EventCallback)>,
}

pub(crate) enum PendingKind {
    Call(oneshot::Sender<Result<Value, StreamError>>),
    Subscribe { query: String, id: SubscriptionId },
    Unsubscribe { query: String },
}

pub(crate) struct PendingRequest {
    pub sent_at: Instant,
    pub kind: PendingKind,
}

pub(crate) struct Inner {
    pub connection: ConnectionState,
    /// Bumped on every transition to `Connected`.
    pub epoch: u64,
    /// Keyed by query, in first-subscribed order.
    pub subscriptions: IndexMap<String, Subscription>,
    pub pending: HashMap<RpcId, PendingRequest>,
    pub next_handle: u64,
}

pub(crate) struct ClientState {
    inner: Mutex<Inner>,
    next_request: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    termination_tx: watch::Sender<Option<Termination>>,
}

impl ClientState {
    pub fn new() -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (termination_tx, _) = watch::channel(None);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                connection: ConnectionState::Disconnected,
                epoch: 0,
                subscriptions: IndexMap::new(),
                pending: HashMap::new(),
                next_handle: 1,
            }),
            next_request: AtomicU64::new(1),
            state_tx,
            termination_tx,
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    /// Numeric JSON-RPC id for the next call or unsubscribe request.
    pub fn next_request_id(&self) -> RpcId {
        RpcId::Number(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn watch_termination(&self) -> watch::Receiver<Option<Termination>> {
        self.termination_tx.subscribe()
    }

    /// Move to `to`. Returns `false` if the client is already closed.
    pub fn transition(&self, to: ConnectionState) -> bool {
        let mut inner = self.lock();
        self.transition_locked(&mut inner, to)
    }

    fn transition_locked(&self, inner: &mut Inner, to: ConnectionState) -> bool {
        if inner.connection == ConnectionState::Closed {
            return false;
        }
        if inner.connection != to {
            tracing::debug!(from = %inner.connection, to = %to, "connection state");
            inner.connection = to;
            self.state_tx.send_replace(to);
        }
        true
    }

    /// `Connecting → Connected`. Marks every subscription as pending on the
    /// new connection and returns the epoch plus the `(query, id)` pairs to
    /// replay, in subscribe order.
    pub fn enter_connected(&self) -> Option<(u64, Vec<(String, SubscriptionId)>)> {
        let mut inner = self.lock();
        if !self.transition_locked(&mut inner, ConnectionState::Connected) {
            return None;
        }
        inner.epoch += 1;
        let replay = inner
            .subscriptions
            .iter_mut()
            .map(|(query, sub)| {
                sub.wire = WireStatus::Pending;
                (query.clone(), sub.id.clone())
            })
            .collect();
        Some((inner.epoch, replay))
    }

    /// `Connected → Reconnecting`. Subscriptions stay registered but are no
    /// longer on the wire; in-flight calls fail with a connection reset.
    pub fn enter_reconnecting(&self) -> bool {
        let mut inner = self.lock();
        if !self.transition_locked(&mut inner, ConnectionState::Reconnecting) {
            return false;
        }
        for sub in inner.subscriptions.values_mut() {
            sub.wire = WireStatus::Unsent;
        }
        fail_pending(&mut inner.pending, || TransportError::ConnectionReset.into());
        true
    }

    /// Terminal transition to `Closed`: clears the registry, fails pending
    /// calls and publishes `termination`. Returns the dropped callbacks, or
    /// `None` if the client was already closed.
    pub fn finish(&self, termination: Termination) -> Option<Vec<EventCallback>> {
        let mut inner = self.lock();
        if inner.connection == ConnectionState::Closed {
            return None;
        }
        inner.connection = ConnectionState::Closed;
        self.state_tx.send_replace(ConnectionState::Closed);

        let callbacks = inner
            .subscriptions
            .drain(..)
            .flat_map(|(_, sub)| sub.callbacks.into_iter().map(|(_, cb)| cb))
            .collect();

        match &termination {
            Termination::Closed => fail_pending(&mut inner.pending, || StreamError::Closed),
            Termination::PermanentFailure { attempts } => {
                let attempts = *attempts;
                fail_pending(&mut inner.pending, || {
                    SubscriptionError::PermanentFailure { attempts }.into()
                })
            }
        }
        self.termination_tx.send_replace(Some(termination));
        Some(callbacks)
    }

    /// Record an in-flight request. A call made after close is failed
    /// immediately instead of being parked, and a call whose caller already
    /// gave up is not recorded at all.
    pub fn track(&self, id: RpcId, kind: PendingKind) -> bool {
        let mut inner = self.lock();
        if let PendingKind::Call(reply) = &kind {
            if reply.is_closed() {
                return false;
            }
        }
        if inner.connection == ConnectionState::Closed {
            if let PendingKind::Call(reply) = kind {
                let _ = reply.send(Err(StreamError::Closed));
            }
            return false;
        }
        inner.pending.insert(
            id,
            PendingRequest {
                sent_at: Instant::now(),
                kind,
            },
        );
        true
    }

    pub fn resolve(&self, id: &RpcId) -> Option<PendingRequest> {
        self.lock().pending.remove(id)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}

fn fail_pending(pending: &mut HashMap<RpcId, PendingRequest>, err: impl Fn() -> StreamError) {
    for (_, request) in pending.drain() {
        if let PendingKind::Call(reply) = request.kind {
            let _ = reply.send(Err(err()));
        }
    }
}

//! Subscription registry.
//!
//! Maps each query to one locally generated id and the callbacks interested
//! in it. Several callbacks on the same query share a single wire
//! subscription. Membership is independent of the connection: subscribing and
//! unsubscribing always succeed immediately, and the controller replays every
//! entry after each reconnect.

use std::sync::Arc;

use tokio::sync::mpsc;

use chainstream_core::error::{StreamError, SubscriptionError};
use chainstream_core::{DecodedEvent, RpcId, SubscriptionId};

use crate::controller::Command;
use crate::state::{ClientState, ConnectionState, Subscription, WireStatus};

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Event(DecodedEvent),
    /// Terminal for the subscription; nothing follows it.
    Error(SubscriptionError),
}

/// Subscriber callback. Invoked from the client's background task, never
/// while the registry lock is held, so it may subscribe or unsubscribe.
pub type EventCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Returned by `subscribe`; removes its callback when unsubscribed.
pub struct SubscriptionHandle {
    query: String,
    id: SubscriptionId,
    handle: u64,
    registry: SubscriptionRegistry,
}

impl SubscriptionHandle {
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The shared id of the wire subscription this callback belongs to.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Remove this callback. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry.unsubscribe(&self)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("query", &self.query)
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Registry of active subscriptions, shared with the controller.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    state: Arc<ClientState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(state: Arc<ClientState>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { state, commands }
    }

    /// Add `callback` to the subscription for `query`, creating it if needed.
    ///
    /// Returns once the registry is updated. A new subscription is sent to
    /// the node right away when connected, otherwise on the next connect.
    pub fn subscribe(
        &self,
        query: impl Into<String>,
        callback: EventCallback,
    ) -> Result<SubscriptionHandle, StreamError> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(StreamError::InvalidQuery(query));
        }

        let mut inner = self.state.lock();
        if inner.connection == ConnectionState::Closed {
            return Err(StreamError::Closed);
        }
        let handle = inner.next_handle;
        inner.next_handle += 1;

        let (id, created) = match inner.subscriptions.get_mut(&query) {
            Some(sub) => {
                sub.callbacks.push((handle, callback));
                (sub.id.clone(), false)
            }
            None => {
                let id = loop {
                    let candidate = SubscriptionId::generate();
                    if !inner.subscriptions.values().any(|s| s.id == candidate) {
                        break candidate;
                    }
                };
                inner.subscriptions.insert(
                    query.clone(),
                    Subscription {
                        id: id.clone(),
                        wire: WireStatus::Unsent,
                        callbacks: vec![(handle, callback)],
                    },
                );
                (id, true)
            }
        };
        let connected = inner.connection == ConnectionState::Connected;
        drop(inner);

        if created {
            tracing::debug!(query = %query, subscription_id = %id, connected, "subscription created");
            if connected {
                let _ = self.commands.send(Command::Subscribe { query: query.clone() });
            }
        }

        Ok(SubscriptionHandle {
            query,
            id,
            handle,
            registry: self.clone(),
        })
    }

    /// Like [`subscribe`](Self::subscribe), but notifications are delivered
    /// on a channel.
    pub fn subscribe_channel(
        &self,
        query: impl Into<String>,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Notification>), StreamError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(
            query,
            Arc::new(move |n: &Notification| {
                let _ = tx.send(n.clone());
            }),
        )?;
        Ok((handle, rx))
    }

    /// Remove the callback behind `handle`. The last callback for a query
    /// also removes the subscription and, if it reached the node on the
    /// current connection, sends a best-effort `unsubscribe`.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut inner = self.state.lock();
        let Some(sub) = inner.subscriptions.get_mut(&handle.query) else {
            return false;
        };
        if sub.id != handle.id {
            return false;
        }
        let before = sub.callbacks.len();
        sub.callbacks.retain(|(h, _)| *h != handle.handle);
        if sub.callbacks.len() == before {
            return false;
        }
        if !sub.callbacks.is_empty() {
            return true;
        }

        let on_wire = sub.wire != WireStatus::Unsent;
        inner.subscriptions.shift_remove(&handle.query);
        let connected = inner.connection == ConnectionState::Connected;
        let epoch = inner.epoch;
        drop(inner);

        tracing::debug!(query = %handle.query, subscription_id = %handle.id, "subscription removed");
        if on_wire && connected {
            let _ = self.commands.send(Command::Unsubscribe {
                query: handle.query.clone(),
                epoch,
            });
        }
        true
    }

    /// Every wanted subscription as `(query, id)`, first-subscribed first.
    pub fn all_active(&self) -> Vec<(String, SubscriptionId)> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .map(|(query, sub)| (query.clone(), sub.id.clone()))
            .collect()
    }

    pub fn contains(&self, query: &str) -> bool {
        self.state.lock().subscriptions.contains_key(query)
    }

    /// Number of callbacks registered for `query`.
    pub fn callback_count(&self, query: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(query)
            .map_or(0, |sub| sub.callbacks.len())
    }

    /// Returns `true` once the node acknowledged `query` on this connection.
    pub fn is_confirmed(&self, query: &str) -> bool {
        self.state
            .lock()
            .subscriptions
            .get(query)
            .is_some_and(|sub| sub.wire == WireStatus::Confirmed)
    }

    /// Number of distinct subscribed queries.
    pub fn len(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim an unsent subscription for sending on the current connection.
    pub(crate) fn take_unsent(&self, query: &str) -> Option<SubscriptionId> {
        let mut inner = self.state.lock();
        if inner.connection != ConnectionState::Connected {
            return None;
        }
        let sub = inner.subscriptions.get_mut(query)?;
        if sub.wire != WireStatus::Unsent {
            return None;
        }
        sub.wire = WireStatus::Pending;
        Some(sub.id.clone())
    }

    pub(crate) fn confirm(&self, query: &str, id: &SubscriptionId) -> bool {
        let mut inner = self.state.lock();
        match inner.subscriptions.get_mut(query) {
            Some(sub) if sub.id == *id && sub.wire == WireStatus::Pending => {
                sub.wire = WireStatus::Confirmed;
                true
            }
            _ => false,
        }
    }

    /// Drop a subscription the node refused, returning its callbacks.
    pub(crate) fn reject(&self, query: &str, id: &SubscriptionId) -> Option<Vec<EventCallback>> {
        let mut inner = self.state.lock();
        if inner.subscriptions.get(query)?.id != *id {
            return None;
        }
        let sub = inner.subscriptions.shift_remove(query)?;
        Some(sub.callbacks.into_iter().map(|(_, cb)| cb).collect())
    }

    /// Resolve a push to its subscription: by query, then by echoed id.
    pub(crate) fn callbacks_for_push(
        &self,
        query: &str,
        id: Option<&RpcId>,
    ) -> Option<(SubscriptionId, Vec<EventCallback>)> {
        let inner = self.state.lock();
        let sub = inner.subscriptions.get(query).or_else(|| match id {
            Some(RpcId::String(echoed)) => inner
                .subscriptions
                .values()
                .find(|sub| sub.id.as_str() == echoed),
            _ => None,
        })?;
        Some((
            sub.id.clone(),
            sub.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        ))
    }
}

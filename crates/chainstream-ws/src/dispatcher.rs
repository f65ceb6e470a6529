//! Routes decoded pushes to subscriber callbacks.

use std::panic::{self, AssertUnwindSafe};

use chainstream_core::envelope::Push;
use chainstream_core::error::ProtocolError;
use chainstream_core::{AttributeEncoding, DecodedEvent};

use crate::subscriptions::{EventCallback, Notification, SubscriptionRegistry};

pub(crate) struct Dispatcher {
    registry: SubscriptionRegistry,
    encoding: AttributeEncoding,
}

impl Dispatcher {
    pub fn new(registry: SubscriptionRegistry, encoding: AttributeEncoding) -> Self {
        Self { registry, encoding }
    }

    /// Deliver one push to every callback of its subscription, in
    /// registration order. Returns the number of callbacks invoked.
    ///
    /// A push for a query nobody holds (typically one unsubscribed a moment
    /// ago) is expected and dropped quietly.
    pub fn dispatch(&self, push: Push) -> usize {
        let Some((id, callbacks)) = self.registry.callbacks_for_push(&push.query, push.id.as_ref())
        else {
            tracing::trace!(query = %push.query, "dropping push for unknown subscription");
            return 0;
        };

        match DecodedEvent::from_push(&push, self.encoding) {
            Ok(event) => {
                tracing::trace!(
                    subscription_id = %id,
                    kind = %event.kind,
                    attributes = event.attributes.len(),
                    "dispatching event"
                );
                deliver(&callbacks, &Notification::Event(event))
            }
            Err(e) => {
                tracing::warn!(subscription_id = %id, query = %push.query, error = %e, "undecodable push payload");
                0
            }
        }
    }

    /// Log and drop a frame the codec could not make sense of.
    pub fn discard(&self, error: &ProtocolError) {
        tracing::warn!(error = %error, "discarding malformed frame");
    }
}

/// Invoke each callback, isolating panics so one failing subscriber cannot
/// starve the rest. Returns how many ran to completion.
pub(crate) fn deliver(callbacks: &[EventCallback], notification: &Notification) -> usize {
    let mut delivered = 0;
    for callback in callbacks {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(notification))) {
            Ok(()) => delivered += 1,
            Err(_) => tracing::warn!("subscription callback panicked"),
        }
    }
    delivered
}

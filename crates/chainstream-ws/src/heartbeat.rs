//! Heartbeat liveness monitoring.
//!
//! A peer that stops responding without closing its socket never produces a
//! close event, so the monitor pings on a fixed interval and declares the
//! connection dead when nothing at all arrives within `timeout` of a ping,
//! or when the ping itself cannot be queued within `timeout`.
//! Any inbound frame counts as liveness, not only pongs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};

use chainstream_core::error::TransportError;
use chainstream_core::transport::{FrameSender, OutboundFrame};

/// Ping cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Timestamp of the most recent liveness signal on one connection.
#[derive(Debug)]
pub struct Liveness {
    last: Mutex<Instant>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Record a liveness signal.
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if a signal arrived at or after `at`.
    pub fn seen_since(&self, at: Instant) -> bool {
        self.last_seen() >= at
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the heartbeat loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// No liveness signal within `timeout` of a ping.
    Dead { timeout: Duration },
    /// The ping could not be sent; the transport is already gone.
    TransportGone,
}

/// Ping every `interval` until the connection looks dead.
///
/// Runs for the lifetime of one connection; the controller aborts it when
/// the connection ends for any other reason.
pub async fn run_heartbeat(
    liveness: Arc<Liveness>,
    sender: FrameSender,
    config: HeartbeatConfig,
) -> HeartbeatOutcome {
    let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let pinged_at = Instant::now();
        match sender.send_within(OutboundFrame::Ping, config.timeout).await {
            Ok(()) => tracing::trace!("liveness ping sent"),
            // A buffer nobody drains is as dead as a silent peer.
            Err(TransportError::Closed(_)) => {
                tracing::warn!(
                    timeout_ms = config.timeout.as_millis() as u64,
                    "liveness ping could not be queued"
                );
                return HeartbeatOutcome::Dead {
                    timeout: config.timeout,
                };
            }
            Err(_) => return HeartbeatOutcome::TransportGone,
        }

        time::sleep_until(pinged_at + config.timeout).await;
        if !liveness.seen_since(pinged_at) {
            tracing::warn!(
                timeout_ms = config.timeout.as_millis() as u64,
                "no liveness signal after ping"
            );
            return HeartbeatOutcome::Dead {
                timeout: config.timeout,
            };
        }
    }
}

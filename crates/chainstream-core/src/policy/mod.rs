//! Connection policies.
//!
//! ```text
//! Connected ─lost─▶ Reconnecting ─delay(attempt)─▶ Connecting ─fail─▶ Reconnecting …
//! ```

pub mod backoff;

pub use backoff::{ReconnectConfig, ReconnectPolicy, ReconnectState};

//! Client-side subscription identifiers.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Digits followed by lowercase letters.
const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of a generated id.
pub const SUBSCRIPTION_ID_LEN: usize = 9;

/// Locally generated subscription id.
///
/// Assigned before the server acknowledges anything, so inbound pushes can be
/// matched to a subscription without waiting on a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a random 9-character base-36 id.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..SUBSCRIPTION_ID_LEN)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Builder for CometBFT event query strings.
//!
//! ```
//! use chainstream_core::query::Query;
//!
//! let q = Query::tx().and_eq("message.sender", "akash1xyz").and_gte("tx.height", 100);
//! assert_eq!(
//!     q.to_string(),
//!     "tm.event='Tx' AND message.sender='akash1xyz' AND tx.height>=100"
//! );
//! ```

use std::fmt;

/// A conjunction of query conditions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    conditions: Vec<String>,
}

impl Query {
    /// `tm.event='<kind>'`
    pub fn event(kind: &str) -> Self {
        Self::default().and_eq("tm.event", kind)
    }

    /// Transaction results.
    pub fn tx() -> Self {
        Self::event("Tx")
    }

    /// Committed blocks.
    pub fn new_block() -> Self {
        Self::event("NewBlock")
    }

    /// The result of a single transaction. Hashes are matched upper-case.
    pub fn tx_hash(hash: &str) -> Self {
        Self::tx().and_eq("tx.hash", &hash.to_ascii_uppercase())
    }

    /// `key='value'`. Single quotes inside `value` are dropped; the query
    /// grammar has no escape for them.
    pub fn and_eq(mut self, key: &str, value: &str) -> Self {
        let value: String = value.chars().filter(|c| *c != '\'').collect();
        self.conditions.push(format!("{key}='{value}'"));
        self
    }

    /// `key=value` for numeric attributes.
    pub fn and_num(mut self, key: &str, value: u64) -> Self {
        self.conditions.push(format!("{key}={value}"));
        self
    }

    /// `key>=value`
    pub fn and_gte(mut self, key: &str, value: u64) -> Self {
        self.conditions.push(format!("{key}>={value}"));
        self
    }

    /// `key<=value`
    pub fn and_lte(mut self, key: &str, value: u64) -> Self {
        self.conditions.push(format!("{key}<={value}"));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.conditions.join(" AND "))
    }
}

impl From<Query> for String {
    fn from(q: Query) -> Self {
        q.to_string()
    }
}

//! JSON-RPC 2.0 envelope codec.
//!
//! Outbound calls are encoded as `{jsonrpc: "2.0", id, method, params}`.
//! Inbound frames decode into an [`Envelope`]: a call result, an error reply,
//! a subscription push, or `Malformed` for anything else. Decoding never
//! fails outright; bad input is reported through [`Envelope::Malformed`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::id::SubscriptionId;

/// The only protocol version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method used to open a subscription.
pub const SUBSCRIBE_METHOD: &str = "subscribe";

/// Method used to close a subscription.
pub const UNSUBSCRIBE_METHOD: &str = "unsubscribe";

/// JSON-RPC request ID — string, number, or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl From<&SubscriptionId> for RpcId {
    fn from(id: &SubscriptionId) -> Self {
        Self::String(id.as_str().to_string())
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RpcId,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: RpcId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }

    /// `subscribe` request. The locally generated subscription id doubles as
    /// the request id so the acknowledgment and any echoed pushes correlate
    /// without a server-assigned identifier.
    pub fn subscribe(id: &SubscriptionId, query: &str) -> Self {
        Self::new(id.into(), SUBSCRIBE_METHOD, serde_json::json!({ "query": query }))
    }

    /// `unsubscribe` request for `query`.
    pub fn unsubscribe(id: RpcId, query: &str) -> Self {
        Self::new(id, UNSUBSCRIBE_METHOD, serde_json::json!({ "query": query }))
    }

    /// Serialize into a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// An unsolicited event frame, correlated by its query rather than a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    /// The query the event matched.
    pub query: String,
    /// Request id echoed by servers that tag pushes with the subscribe id.
    pub id: Option<RpcId>,
    /// `{type, value}` event payload.
    pub data: Value,
    /// Flattened `composite.key -> [values]` index, when the server sends one.
    pub events: Option<Value>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Result { id: RpcId, payload: Value },
    ErrorReply { id: RpcId, error: JsonRpcError },
    Push(Push),
    Malformed(ProtocolError),
}

impl Envelope {
    /// Decode one inbound frame.
    pub fn decode(frame: &[u8]) -> Self {
        decode_frame(frame).unwrap_or_else(Envelope::Malformed)
    }
}

fn decode_frame(frame: &[u8]) -> Result<Envelope, ProtocolError> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    if let Some(version) = obj.get("jsonrpc") {
        if version.as_str() != Some(JSONRPC_VERSION) {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()));
        }
    }

    let id = match obj.get("id") {
        Some(raw) => parse_id(raw)?,
        None => None,
    };

    match obj.remove("error") {
        None | Some(Value::Null) => {}
        Some(error) => {
            return Ok(Envelope::ErrorReply {
                id: id.unwrap_or(RpcId::Null),
                error: parse_error(error)?,
            });
        }
    }

    match obj.remove("result") {
        Some(Value::Object(result)) if is_push(&result) => Ok(Envelope::Push(parse_push(result, id))),
        Some(payload) => {
            let id = id.ok_or(ProtocolError::MissingId)?;
            Ok(Envelope::Result { id, payload })
        }
        None => Err(ProtocolError::UnknownShape),
    }
}

fn is_push(result: &Map<String, Value>) -> bool {
    matches!(result.get("query"), Some(Value::String(_))) && result.contains_key("data")
}

fn parse_push(mut result: Map<String, Value>, id: Option<RpcId>) -> Push {
    let query = match result.remove("query") {
        Some(Value::String(q)) => q,
        _ => String::new(),
    };
    Push {
        query,
        id,
        data: result.remove("data").unwrap_or(Value::Null),
        events: result.remove("events").filter(|e| !e.is_null()),
    }
}

fn parse_id(raw: &Value) -> Result<Option<RpcId>, ProtocolError> {
    match raw {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(RpcId::String(s.clone()))),
        Value::Number(_) => Ok(Some(RpcId::Number(parse_u64("id", raw)?))),
        other => Err(ProtocolError::InvalidNumber {
            field: "id".into(),
            value: other.to_string(),
        }),
    }
}

fn parse_error(raw: Value) -> Result<JsonRpcError, ProtocolError> {
    let Value::Object(mut obj) = raw else {
        return Err(ProtocolError::InvalidError("error is not an object".into()));
    };
    let code = obj
        .get("code")
        .ok_or_else(|| ProtocolError::InvalidError("missing code".into()))
        .and_then(|c| parse_i64("error.code", c))?;
    let message = match obj.remove("message") {
        Some(Value::String(m)) => m,
        _ => return Err(ProtocolError::InvalidError("missing message".into())),
    };
    Ok(JsonRpcError {
        code,
        message,
        data: obj.remove("data").filter(|d| !d.is_null()),
    })
}

/// Parse an unsigned integer carried either as a JSON number or as a
/// base-10 string. Hex and signed forms are rejected.
pub fn parse_u64(field: &str, raw: &Value) -> Result<u64, ProtocolError> {
    let parsed = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) if is_decimal(s) => s.parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ProtocolError::InvalidNumber {
        field: field.into(),
        value: raw.to_string(),
    })
}

/// Signed counterpart of [`parse_u64`].
pub fn parse_i64(field: &str, raw: &Value) -> Result<i64, ProtocolError> {
    let parsed = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if is_decimal(s.strip_prefix('-').unwrap_or(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ProtocolError::InvalidNumber {
        field: field.into(),
        value: raw.to_string(),
    })
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

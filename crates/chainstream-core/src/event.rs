//! Decoded domain events.
//!
//! A push's `data` is `{type, value}`. Event attributes arrive as
//! `{key, value}` pairs, base64-encoded by Tendermint-era nodes and as plain
//! strings by newer CometBFT releases. Attributes are taken, in order, from:
//!
//! 1. a flat `value.attributes` list
//! 2. every event under `value.TxResult.result.events`
//! 3. every event under the block result sections of a `NewBlock` payload

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{parse_u64, Push};
use crate::error::ProtocolError;

const BLOCK_RESULT_SECTIONS: [&str; 3] =
    ["result_begin_block", "result_end_block", "result_finalize_block"];

const HEIGHT_POINTERS: [&str; 3] = ["/TxResult/height", "/block/header/height", "/height"];

/// How attribute keys and values are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeEncoding {
    #[default]
    Base64,
    Plain,
}

/// An event delivered to subscribers. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// `(key, value)` pairs in wire order.
    pub attributes: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tx_hash: Option<String>,
}

impl DecodedEvent {
    /// Decode the payload of a subscription push.
    pub fn from_push(push: &Push, encoding: AttributeEncoding) -> Result<Self, ProtocolError> {
        let kind = push
            .data
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::UnknownShape)?
            .to_string();
        let value = push.data.get("value").unwrap_or(&Value::Null);

        let attributes = collect_attributes(value)
            .into_iter()
            .map(|attr| decode_attribute(attr, encoding))
            .collect::<Result<Vec<_>, _>>()?;

        let source_height = HEIGHT_POINTERS
            .iter()
            .find_map(|p| value.pointer(p))
            .map(|h| parse_u64("height", h))
            .transpose()?;

        let source_tx_hash = push
            .events
            .as_ref()
            .and_then(|e| e.get("tx.hash"))
            .and_then(|h| h.get(0))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            kind,
            attributes,
            source_height,
            source_tx_hash,
        })
    }

    /// First value recorded for `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn collect_attributes(value: &Value) -> Vec<&Value> {
    if let Some(Value::Array(attrs)) = value.get("attributes") {
        return attrs.iter().collect();
    }

    let mut out = Vec::new();
    if let Some(events) = value.pointer("/TxResult/result/events") {
        extend_from_events(&mut out, events);
    } else {
        for section in BLOCK_RESULT_SECTIONS {
            if let Some(events) = value.get(section).and_then(|s| s.get("events")) {
                extend_from_events(&mut out, events);
            }
        }
    }
    out
}

fn extend_from_events<'a>(out: &mut Vec<&'a Value>, events: &'a Value) {
    let Value::Array(events) = events else {
        return;
    };
    for event in events {
        if let Some(Value::Array(attrs)) = event.get("attributes") {
            out.extend(attrs.iter());
        }
    }
}

fn decode_attribute(
    attr: &Value,
    encoding: AttributeEncoding,
) -> Result<(String, String), ProtocolError> {
    Ok((
        decode_field(attr, "key", encoding)?,
        decode_field(attr, "value", encoding)?,
    ))
}

fn decode_field(attr: &Value, field: &str, encoding: AttributeEncoding) -> Result<String, ProtocolError> {
    match attr.get(field) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => decode_text(s, encoding),
        Some(other) => Err(ProtocolError::InvalidAttribute(format!(
            "{field} is not a string: {other}"
        ))),
    }
}

fn decode_text(s: &str, encoding: AttributeEncoding) -> Result<String, ProtocolError> {
    match encoding {
        AttributeEncoding::Plain => Ok(s.to_string()),
        AttributeEncoding::Base64 => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|e| ProtocolError::InvalidAttribute(format!("{s:?}: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|e| ProtocolError::InvalidAttribute(format!("{s:?}: {e}")))
        }
    }
}

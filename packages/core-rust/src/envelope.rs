//! Wire envelopes exchanged over the bus.
//!
//! Both envelopes serialize to `MsgPack` with named fields via
//! `rmp_serde::to_vec_named()`, so field names (not positions) are the
//! compatibility contract:
//!
//! ```text
//! Request  = { metadata: {trace_id, span_id, parent_id, language, timezone_offset, token},
//!              name, payload }
//! Response = { code, state, description, timestamp, payload }
//! ```
//!
//! Decoding never guesses: a document that does not match the schema is a
//! [`ProtocolError::Decode`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::{Map, Res};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure to encode or decode an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Call metadata propagated with every remote invocation.
///
/// Empty strings and a zero timezone offset are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub span_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    /// Offset from UTC in seconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timezone_offset: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// A named call with its payload and metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub metadata: Metadata,
    pub name: String,
    #[serde(default)]
    pub payload: Map,
}

/// The reply to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: i32,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub description: String,
    /// Milliseconds since the Unix epoch at which the reply was produced.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Map,
}

impl ResponseEnvelope {
    /// Wraps a handler outcome, stamping the current wall-clock time.
    #[must_use]
    pub fn new(payload: Map, res: &Res) -> Self {
        Self {
            code: res.code,
            state: res.state.clone(),
            description: res.description.clone(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Splits the envelope back into the handler outcome.
    ///
    /// An empty `state` falls back to the description, so a bare
    /// `{code, description}` reply still yields a meaningful state.
    #[must_use]
    pub fn into_parts(self) -> (Map, Res) {
        let state = if self.state.is_empty() {
            self.description.clone()
        } else {
            self.state
        };
        (self.payload, Res::new(self.code, state, self.description))
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serializes a request envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if the payload cannot be serialized.
pub fn encode_request(envelope: &RequestEnvelope) -> Result<Vec<u8>, ProtocolError> {
    rmp_serde::to_vec_named(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Deserializes a request envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] if the bytes are not a request envelope.
pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, ProtocolError> {
    rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Serializes a response envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if the payload cannot be serialized.
pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Vec<u8>, ProtocolError> {
    rmp_serde::to_vec_named(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Deserializes a response envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] if the bytes are not a response envelope.
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, ProtocolError> {
    rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

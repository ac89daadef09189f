//! ---
//! rq_section: "02-messaging-data-model"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Envelope and RPC record codecs."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of characters of a raw item quoted in decode errors.
const PREVIEW_CHARS: usize = 64;

/// Errors raised while encoding or decoding queue items.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The raw item is not a JSON `{traceId, payload}` object.
    #[error("malformed envelope ({source}); raw item: {preview:?}")]
    InvalidEnvelope {
        /// Leading characters of the offending item.
        preview: String,
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },
    /// The envelope decoded but its payload is not an RPC request record.
    #[error("malformed rpc request ({source}); payload: {preview:?}")]
    InvalidRpcRequest {
        /// Leading characters of the offending payload.
        preview: String,
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },
    /// The envelope decoded but its payload is not an RPC response record.
    #[error("malformed rpc response ({source}); payload: {preview:?}")]
    InvalidRpcResponse {
        /// Leading characters of the offending payload.
        preview: String,
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },
    /// Serialising an outgoing record failed.
    #[error("failed to encode queue item: {0}")]
    Encode(#[source] serde_json::Error),
}

fn preview(raw: &str) -> String {
    let mut chars = raw.chars();
    let mut out: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        out.push('…');
    }
    out
}

/// Minimal wrapper placed on every queue key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    /// Identifier used to follow one message across services.
    pub trace_id: String,
    /// Opaque message body.
    pub payload: String,
}

impl Envelope {
    /// Wrap a payload, generating a fresh trace id when none (or an empty one) is supplied.
    pub fn new(payload: impl Into<String>, trace_id: Option<&str>) -> Self {
        let trace_id = match trace_id {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => Uuid::new_v4().to_string(),
        };
        Self {
            trace_id,
            payload: payload.into(),
        }
    }

    /// Serialise the envelope into its wire form.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    /// Parse a raw queue item.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(|source| EnvelopeError::InvalidEnvelope {
            preview: preview(raw),
            source,
        })
    }
}

/// Request record nested inside an envelope payload for request/response calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Identifier pairing this request with its response.
    pub correlation_id: String,
    /// Caller supplied message.
    pub message: String,
    /// Queue key the response must be appended to.
    pub response_channel: String,
}

impl RpcRequest {
    /// Serialise into an envelope payload.
    pub fn to_payload(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    /// Parse an envelope payload.
    pub fn from_payload(payload: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(payload).map_err(|source| EnvelopeError::InvalidRpcRequest {
            preview: preview(payload),
            source,
        })
    }
}

/// Response record appended to a request's response channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    /// Identifier copied from the request.
    pub correlation_id: String,
    /// Responder result; empty when `error` is set.
    pub message: String,
    /// Failure description, only present when the responder replies with errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Successful response.
    pub fn ok(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            message: message.into(),
            error: None,
        }
    }

    /// Explicit failure record.
    pub fn failed(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            message: String::new(),
            error: Some(error.into()),
        }
    }

    /// Serialise into an envelope payload.
    pub fn to_payload(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    /// Parse an envelope payload.
    pub fn from_payload(payload: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(payload).map_err(|source| EnvelopeError::InvalidRpcResponse {
            preview: preview(payload),
            source,
        })
    }
}

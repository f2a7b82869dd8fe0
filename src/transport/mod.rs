//! Outbound delivery of heartbeat payloads.
//!
//! A [`Transport`] only sends. Replies flow back separately into the
//! [`ResponseCorrelator`](crate::agent::ResponseCorrelator), either from the
//! transport itself (HTTP replies) or from whatever collaborator observes
//! the hosted document.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Header carrying the request id on outbound calls.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// One payload ready to leave the agent.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundRequest {
    /// Correlation id, unique per scheduler.
    pub id: u64,
    /// Scheduler generation the request was sent under.
    pub generation: u64,
    /// Fully resolved endpoint URL.
    pub endpoint: String,
    /// JSON payload.
    pub payload: serde_json::Value,
}

/// A reply observed for some request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Echoed request id, when the reply source can provide one.
    #[serde(default, rename = "correlationId", alias = "request_id")]
    pub request_id: Option<u64>,
    /// Reply body. Plain text replies are carried as a JSON string.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Reply {
    /// Reply correlated to `id`.
    pub fn to(id: u64, body: serde_json::Value) -> Self {
        Self {
            request_id: Some(id),
            body,
        }
    }

    /// Reply with no correlation id.
    pub fn anonymous(body: serde_json::Value) -> Self {
        Self {
            request_id: None,
            body,
        }
    }

    /// Parse a raw reply body: JSON when it parses, a string otherwise.
    pub fn parse_body(text: &str) -> serde_json::Value {
        serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
    }
}

/// The "send payload" primitive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Deliver `request`. Success means the payload left the agent, not
    /// that a reply arrived.
    async fn send(&self, request: &OutboundRequest) -> Result<(), TransportError>;
}

//! HTTP transport: POST the payload, feed the response back as the reply.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::agent::ResponseCorrelator;
use crate::error::TransportError;
use crate::transport::{OutboundRequest, REQUEST_ID_HEADER, Reply, Transport};

/// Sends payloads as JSON POSTs and delivers each HTTP response body to
/// the correlator under the request's id.
pub struct HttpTransport {
    client: Client,
    correlator: ResponseCorrelator,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(correlator: ResponseCorrelator, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            correlator,
            timeout,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &OutboundRequest) -> Result<(), TransportError> {
        let endpoint = request.endpoint.as_str();

        let response = self
            .client
            .post(endpoint)
            .header(REQUEST_ID_HEADER, request.id.to_string())
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        endpoint: endpoint.to_string(),
                        after: self.timeout,
                    }
                } else {
                    TransportError::Request {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            });
        }

        // Servers that echo the id win; otherwise the request we just sent
        // is by construction the one this response answers.
        let echoed = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let text = response.text().await.map_err(|e| TransportError::Body {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let reply = Reply {
            request_id: Some(echoed.unwrap_or(request.id)),
            body: Reply::parse_body(&text),
        };

        if !self.correlator.deliver(reply) {
            tracing::debug!(
                request_id = request.id,
                endpoint,
                "HTTP reply arrived after its wait was released"
            );
        }

        Ok(())
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HTTP connector.
//!
//! The transport is a seam: [`HttpTransport`] is the minimal surface the
//! client needs (one request, one reply, a deadline), [`UreqTransport`] is
//! the default blocking implementation, and the integration tests plug in a
//! scripted transport. The connector owns URL construction for both wire
//! layouts, the envelope parse, and request duration logging; interpretation
//! of the `result` payload stays with the per-function response parsers.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::config::HttpMethod;
use crate::error::HsmError;
use crate::error::HsmResult;
use crate::request::ApiRequest;
use crate::wire::ResponseEnvelope;

/// Transport-level failure; the connector maps these onto `Connection`.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The deadline elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,
    /// Connection or I/O error below HTTP.
    #[error("transport I/O: {0}")]
    Io(String),
    /// The server answered outside the 2xx range.
    #[error("HTTP status {0}")]
    Status(u16),
}

/// Raw reply from the transport.
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

/// Minimal HTTP surface the client requires.
pub trait HttpTransport: Send + Sync {
    /// Issues a GET against `url` with the given deadline.
    fn get(&self, url: &str, timeout: Duration) -> Result<TransportReply, TransportError>;

    /// Issues a POST of a JSON body against `url` with the given deadline.
    fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<TransportReply, TransportError>;
}

/// Blocking transport over `ureq`.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    /// Transport with a fresh agent (connection pooling included).
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
        }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UreqTransport {
    fn run(&self, req: ureq::Request, body: Option<String>) -> Result<TransportReply, TransportError> {
        let result = match body {
            // The body is sent as a plain string; the service does not
            // require a content type and the browser clients omit it.
            Some(body) => req.send_string(&body),
            None => req.call(),
        };
        match result {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .into_string()
                    .map_err(|e| TransportError::Io(e.to_string()))?;
                Ok(TransportReply { status, body })
            }
            Err(ureq::Error::Status(status, _)) => Err(TransportError::Status(status)),
            Err(ureq::Error::Transport(t)) => match t.kind() {
                // Deadline expiry surfaces as an I/O transport error.
                ureq::ErrorKind::Io => Err(TransportError::Timeout),
                _ => Err(TransportError::Io(t.to_string())),
            },
        }
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, url: &str, timeout: Duration) -> Result<TransportReply, TransportError> {
        self.run(self.agent.get(url).timeout(timeout), None)
    }

    fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<TransportReply, TransportError> {
        self.run(self.agent.post(url).timeout(timeout), Some(body.to_string()))
    }
}

/// Issues resolved requests and parses their envelopes.
#[derive(Clone)]
pub struct Connector {
    transport: Arc<dyn HttpTransport>,
}

impl Connector {
    /// Connector over the default blocking transport.
    pub fn new() -> Self {
        Self::with_transport(Arc::new(UreqTransport::new()))
    }

    /// Connector over a caller-supplied transport.
    pub fn with_transport(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Sends the request and returns the parsed envelope.
    ///
    /// Transport failures become `Connection`; a body that is not a valid
    /// envelope becomes `Corrupt`. Status-word interpretation is left to the
    /// caller's response parser.
    #[instrument(skip_all, fields(function = %req.function, method = ?req.method))]
    pub fn call(&self, req: &ApiRequest) -> HsmResult<ResponseEnvelope> {
        let started = Instant::now();
        let reply = match req.method {
            HttpMethod::Post => self.transport.post(&req.url(), &req.post_body(), req.timeout),
            HttpMethod::Get => {
                let url = format!("{}/{}", req.url(), req.get_segment());
                self.transport.get(&url, req.timeout)
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let reply = reply.map_err(|e| {
            warn!(elapsed_ms, error = %e, "request failed");
            HsmError::Connection(e.to_string())
        })?;
        debug!(elapsed_ms, status = reply.status, "request completed");

        ResponseEnvelope::from_json(&reply.body)
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Client configuration.
//!
//! Everything is optional at the field level; effective values are resolved
//! per request with the precedence **per-call override > user-object field >
//! configuration > built-in default**. The configuration itself is never
//! mutated by the library; requests clone and merge.

use std::time::Duration;

use crate::error::HsmResult;
use crate::handle::UoHandle;
use crate::retry::RetryPolicy;

/// Default scheme for service endpoints.
pub const DEFAULT_SCHEME: &str = "https";
/// Default port of the process/enroll endpoints.
pub const DEFAULT_PORT: u16 = 11180;
/// Path-level API version segment.
pub const DEFAULT_API_VERSION: &str = "1.0";
/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP method used for service calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HttpMethod {
    /// JSON body in a POST request.
    #[default]
    Post,
    /// Payload appended as an extra path segment.
    Get,
}

/// One service endpoint: scheme, host, port and API version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// URL scheme, `http` or `https`.
    pub scheme: String,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// API version path segment.
    pub api_version: String,
}

impl Endpoint {
    /// Endpoint on the default scheme, port and API version.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: host.into(),
            port: DEFAULT_PORT,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    /// Overrides the scheme.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Overrides the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Base URL including the API version segment.
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.scheme, self.host, self.port, self.api_version
        )
    }
}

/// Client configuration; all fields optional.
#[derive(Clone, Debug, Default)]
pub struct HsmConfig {
    /// Endpoint serving `ProcessData`.
    pub process_endpoint: Option<Endpoint>,
    /// Endpoint serving template and import-key calls.
    pub enroll_endpoint: Option<Endpoint>,
    /// Endpoint serving client registration.
    pub register_endpoint: Option<Endpoint>,
    /// Default api key for calls without a user object.
    pub api_key: Option<String>,
    /// HTTP method; POST when unset.
    pub method: Option<HttpMethod>,
    /// Per-call timeout; 30 s when unset.
    pub timeout: Option<Duration>,
    /// Retry policy for provisioning phases.
    pub retry: Option<RetryPolicy>,
    /// Template-request defaults merged into provisioning calls.
    pub create_template: Option<serde_json::Value>,
}

impl HsmConfig {
    /// Configuration with both endpoints on one host.
    pub fn for_host(host: impl Into<String>) -> Self {
        let endpoint = Endpoint::new(host);
        Self {
            process_endpoint: Some(endpoint.clone()),
            enroll_endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    /// Sets the api key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Absorbs the fields a printable handle carries.
    pub fn with_handle(mut self, handle: &str) -> HsmResult<Self> {
        let parsed = UoHandle::parse(handle)?;
        self.api_key = Some(parsed.api_key);
        Ok(self)
    }

    /// Effective HTTP method.
    pub fn method(&self) -> HttpMethod {
        self.method.unwrap_or_default()
    }

    /// Effective timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Effective retry policy.
    pub fn retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }
}

/// Per-call overrides; the strongest layer of the precedence chain.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Override the HTTP method for this call.
    pub method: Option<HttpMethod>,
    /// Override the timeout for this call.
    pub timeout: Option<Duration>,
    /// Pin the freshness nonce instead of drawing one from the CSPRNG.
    pub nonce: Option<[u8; crate::nonce::NONCE_LEN]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        let ep = Endpoint::new("hsm.example.net");
        assert_eq!(ep.base_url(), "https://hsm.example.net:11180/1.0");
        let ep = Endpoint::new("localhost").with_scheme("http").with_port(8080);
        assert_eq!(ep.base_url(), "http://localhost:8080/1.0");
    }

    #[test]
    fn test_config_defaults() {
        let cfg = HsmConfig::default();
        assert_eq!(cfg.method(), HttpMethod::Post);
        assert_eq!(cfg.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(cfg.retry().max_attempts, RetryPolicy::default().max_attempts);
    }

    #[test]
    fn test_config_absorbs_handle() {
        let cfg = HsmConfig::for_host("h")
            .with_handle("TEST_API00000012ab0000100000")
            .unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("TEST_API"));
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common request assembly.
//!
//! Every service call shares the same header material: the object id (a
//! printable handle or bare api key), the function name, a request nonce and
//! the protocol version. This module assembles that header and resolves the
//! effective endpoint, method and timeout, layering per-call overrides over
//! user-object fields over the configuration over built-in defaults.

use std::time::Duration;

use crate::config::CallOptions;
use crate::config::Endpoint;
use crate::config::HsmConfig;
use crate::config::HttpMethod;
use crate::error::HsmError;
use crate::error::HsmResult;
use crate::uo::UserObject;

/// Service functions this client speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiFunction {
    /// Invoke a user object.
    ProcessData,
    /// Fetch a provisioning template.
    GetUserObjectTemplate,
    /// Upload a filled template.
    CreateUserObject,
    /// List the service's RSA import keys.
    GetImportPublicKey,
}

impl ApiFunction {
    /// Function name as it appears in the URL path.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFunction::ProcessData => "ProcessData",
            ApiFunction::GetUserObjectTemplate => "GetUserObjectTemplate",
            ApiFunction::CreateUserObject => "CreateUserObject",
            ApiFunction::GetImportPublicKey => "GetImportPublicKey",
        }
    }

    /// Which configured endpoint serves this function.
    pub fn uses_enroll_endpoint(&self) -> bool {
        !matches!(self, ApiFunction::ProcessData)
    }
}

impl std::fmt::Display for ApiFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of one service call.
#[derive(Clone, Debug)]
pub enum RequestBody {
    /// A `ProcessData` wire string; POSTs wrap it as `{"data": ...}`.
    ProcessData(String),
    /// A JSON object sent verbatim.
    Json(serde_json::Value),
}

/// A fully resolved request, ready for the connector.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    /// Handle or api key addressing the call.
    pub object_id: String,
    /// Invoked function.
    pub function: ApiFunction,
    /// Request nonce path segment, hex.
    pub nonce: String,
    /// Effective endpoint.
    pub endpoint: Endpoint,
    /// Effective HTTP method.
    pub method: HttpMethod,
    /// Effective timeout.
    pub timeout: Duration,
    /// Call payload.
    pub body: RequestBody,
}

impl ApiRequest {
    /// Resolves a request against the configuration layers.
    ///
    /// `object_id` comes from the user object when one is involved, else
    /// from the configured api key. Endpoint, method and timeout resolve
    /// with the precedence per-call > user-object field > configuration >
    /// built-in default.
    pub fn resolve(
        config: &HsmConfig,
        uo: Option<&UserObject>,
        opts: &CallOptions,
        object_id: String,
        function: ApiFunction,
        nonce: String,
        body: RequestBody,
    ) -> HsmResult<Self> {
        let configured = if function.uses_enroll_endpoint() {
            config.enroll_endpoint.as_ref()
        } else {
            config.process_endpoint.as_ref()
        };
        let endpoint = uo
            .map(|uo| uo.endpoint())
            .or(configured)
            .cloned()
            .ok_or(HsmError::InvalidArgument("no endpoint configured"))?;

        Ok(Self {
            object_id,
            function,
            nonce,
            endpoint,
            method: opts
                .method
                .or(uo.and_then(|uo| uo.method()))
                .unwrap_or(config.method()),
            timeout: opts
                .timeout
                .or(uo.and_then(|uo| uo.timeout()))
                .unwrap_or(config.timeout()),
            body,
        })
    }

    /// URL for the POST layout; GET appends the payload segment.
    pub fn url(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.endpoint.base_url(),
            self.object_id,
            self.function,
            self.nonce
        )
    }

    /// The JSON body a POST carries.
    pub fn post_body(&self) -> serde_json::Value {
        match &self.body {
            RequestBody::ProcessData(wire) => serde_json::json!({ "data": wire }),
            RequestBody::Json(value) => value.clone(),
        }
    }

    /// The extra path segment a GET carries.
    pub fn get_segment(&self) -> String {
        match &self.body {
            RequestBody::ProcessData(wire) => wire.clone(),
            RequestBody::Json(value) => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::UoHandle;

    fn config() -> HsmConfig {
        let mut cfg = HsmConfig::for_host("hsm.example.net");
        cfg.enroll_endpoint = Some(Endpoint::new("enroll.example.net"));
        cfg
    }

    fn resolve(function: ApiFunction) -> ApiRequest {
        ApiRequest::resolve(
            &config(),
            None,
            &CallOptions::default(),
            "KEY00000000010000000000".into(),
            function,
            "00112233aabbccdd".into(),
            RequestBody::ProcessData("Packet0_PLAINAES_0000".into()),
        )
        .unwrap()
    }

    #[test]
    fn test_url_layout() {
        let req = resolve(ApiFunction::ProcessData);
        assert_eq!(
            req.url(),
            "https://hsm.example.net:11180/1.0/KEY00000000010000000000/ProcessData/00112233aabbccdd"
        );
    }

    #[test]
    fn test_endpoint_selection() {
        assert_eq!(
            resolve(ApiFunction::ProcessData).endpoint.host,
            "hsm.example.net"
        );
        assert_eq!(
            resolve(ApiFunction::GetUserObjectTemplate).endpoint.host,
            "enroll.example.net"
        );
        assert_eq!(
            resolve(ApiFunction::GetImportPublicKey).endpoint.host,
            "enroll.example.net"
        );
    }

    #[test]
    fn test_body_shapes() {
        let req = resolve(ApiFunction::ProcessData);
        assert_eq!(
            req.post_body(),
            serde_json::json!({ "data": "Packet0_PLAINAES_0000" })
        );
        assert_eq!(req.get_segment(), "Packet0_PLAINAES_0000");

        let json = ApiRequest::resolve(
            &config(),
            None,
            &CallOptions::default(),
            "KEY".into(),
            ApiFunction::CreateUserObject,
            "n".into(),
            RequestBody::Json(serde_json::json!({ "objectid": "0000ee01" })),
        )
        .unwrap();
        assert_eq!(
            json.post_body(),
            serde_json::json!({ "objectid": "0000ee01" })
        );
        assert_eq!(json.get_segment(), r#"{"objectid":"0000ee01"}"#);
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let err = ApiRequest::resolve(
            &HsmConfig::default(),
            None,
            &CallOptions::default(),
            "k".into(),
            ApiFunction::ProcessData,
            "n".into(),
            RequestBody::Json(serde_json::Value::Null),
        )
        .err();
        assert!(matches!(err, Some(HsmError::InvalidArgument(_))));
    }

    #[test]
    fn test_precedence_per_call_over_config() {
        let mut cfg = config();
        cfg.timeout = Some(Duration::from_secs(10));
        cfg.method = Some(HttpMethod::Post);
        let opts = CallOptions {
            method: Some(HttpMethod::Get),
            timeout: Some(Duration::from_secs(2)),
            nonce: None,
        };
        let req = ApiRequest::resolve(
            &cfg,
            None,
            &opts,
            "k".into(),
            ApiFunction::ProcessData,
            "n".into(),
            RequestBody::Json(serde_json::Value::Null),
        )
        .unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_precedence_uo_between_per_call_and_config() {
        let mut cfg = config();
        cfg.timeout = Some(Duration::from_secs(10));
        cfg.method = Some(HttpMethod::Post);
        let uo = UserObject::new(
            UoHandle::new("KEY", 1, 0),
            [0u8; 32],
            [0u8; 32],
            Endpoint::new("uo.example.net"),
        )
        .with_method(HttpMethod::Get)
        .with_timeout(Duration::from_secs(5));

        // No per-call overrides: the object's fields beat the config, and
        // its endpoint replaces the configured one.
        let req = ApiRequest::resolve(
            &cfg,
            Some(&uo),
            &CallOptions::default(),
            "k".into(),
            ApiFunction::ProcessData,
            "n".into(),
            RequestBody::Json(serde_json::Value::Null),
        )
        .unwrap();
        assert_eq!(req.endpoint.host, "uo.example.net");
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.timeout, Duration::from_secs(5));

        // Per-call overrides still beat the object's fields.
        let opts = CallOptions {
            method: Some(HttpMethod::Post),
            timeout: Some(Duration::from_secs(1)),
            nonce: None,
        };
        let req = ApiRequest::resolve(
            &cfg,
            Some(&uo),
            &opts,
            "k".into(),
            ApiFunction::ProcessData,
            "n".into(),
            RequestBody::Json(serde_json::Value::Null),
        )
        .unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.timeout, Duration::from_secs(1));

        // An object without pinned fields falls through to the config.
        let plain = UserObject::new(
            UoHandle::new("KEY", 2, 0),
            [0u8; 32],
            [0u8; 32],
            Endpoint::new("uo.example.net"),
        );
        let req = ApiRequest::resolve(
            &cfg,
            Some(&plain),
            &CallOptions::default(),
            "k".into(),
            ApiFunction::ProcessData,
            "n".into(),
            RequestBody::Json(serde_json::Value::Null),
        )
        .unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.timeout, Duration::from_secs(10));
    }
}

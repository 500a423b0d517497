// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! User objects and the client facade.
//!
//! A [`UserObject`] is the client-side record of one HSM-resident object:
//! its id, capability word, api key, endpoint, the two 256-bit transport
//! keys negotiated at creation, and optional per-object method/timeout pins
//! that sit between per-call options and the configuration. [`HsmClient`]
//! owns the configuration and the connector and exposes the service
//! operations; all crypto and parsing is synchronous, the HTTP call is the
//! only suspension point.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::instrument;
use zeroize::Zeroizing;

use uohsm_crypto::RsaPublicKey;

use crate::auth::AuthSession;
use crate::auth::USER_ID_LEN;
use crate::config::CallOptions;
use crate::config::Endpoint;
use crate::config::HsmConfig;
use crate::config::HttpMethod;
use crate::connector::Connector;
use crate::connector::HttpTransport;
use crate::error::CorruptKind;
use crate::error::HsmError;
use crate::error::HsmResult;
use crate::handle::UoHandle;
use crate::nonce::gen_nonce;
use crate::request::ApiFunction;
use crate::request::ApiRequest;
use crate::request::RequestBody;
use crate::wire::process_data::ProcessDataReq;
use crate::wire::process_data::ProcessDataResp;
use crate::wire::process_data::RequestType;
use crate::wire::status::SW_STAT_OK;

/// Client-side record of one user object.
#[derive(Clone)]
pub struct UserObject {
    handle: UoHandle,
    enc_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
    endpoint: Endpoint,
    method: Option<HttpMethod>,
    timeout: Option<Duration>,
}

impl UserObject {
    /// Builds a record from a handle, the transport keys and the endpoint
    /// serving it.
    pub fn new(
        handle: UoHandle,
        enc_key: [u8; 32],
        mac_key: [u8; 32],
        endpoint: Endpoint,
    ) -> Self {
        Self {
            handle,
            enc_key: Zeroizing::new(enc_key),
            mac_key: Zeroizing::new(mac_key),
            endpoint,
            method: None,
            timeout: None,
        }
    }

    /// Pins the HTTP method for calls against this object.
    ///
    /// Sits between per-call options and the configuration in the
    /// resolution order.
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    /// Pins the timeout for calls against this object.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The printable handle.
    pub fn handle(&self) -> &UoHandle {
        &self.handle
    }

    /// The 32-bit object id.
    pub fn uo_id(&self) -> u32 {
        self.handle.uo_id
    }

    /// The capability word.
    pub fn uo_type(&self) -> u32 {
        self.handle.uo_type
    }

    /// The endpoint this object is served from.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The HTTP method pinned to this object, when any.
    pub fn method(&self) -> Option<HttpMethod> {
        self.method
    }

    /// The timeout pinned to this object, when any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn enc_key(&self) -> &[u8] {
        self.enc_key.as_ref()
    }

    pub(crate) fn mac_key(&self) -> &[u8] {
        self.mac_key.as_ref()
    }
}

impl std::fmt::Debug for UserObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys stay out of debug output.
        f.debug_struct("UserObject")
            .field("handle", &self.handle.to_string())
            .field("endpoint", &self.endpoint.host)
            .finish()
    }
}

/// One RSA import key as returned by `GetImportPublicKey`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportKeyRecord {
    /// Server-side key id.
    pub id: i64,
    /// Key kind reported by the service.
    pub r#type: String,
    /// Certificate over the key, when the service publishes one.
    #[serde(default)]
    pub certificate: Option<String>,
    /// TLV-hex public key; spaces allowed.
    pub key: String,
}

impl ImportKeyRecord {
    /// Parses the TLV-hex public key.
    pub fn parse(&self) -> HsmResult<RsaPublicKey> {
        let compact: String = self.key.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes =
            hex::decode(compact).map_err(|_| HsmError::Corrupt(CorruptKind::Framing))?;
        Ok(RsaPublicKey::from_tlv(&bytes)?)
    }
}

/// Client facade over the user-object service.
#[derive(Clone)]
pub struct HsmClient {
    config: HsmConfig,
    connector: Connector,
}

impl HsmClient {
    /// Client over the default blocking transport.
    pub fn new(config: HsmConfig) -> Self {
        Self {
            config,
            connector: Connector::new(),
        }
    }

    /// Client over a caller-supplied transport.
    pub fn with_transport(config: HsmConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config,
            connector: Connector::with_transport(transport),
        }
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &HsmConfig {
        &self.config
    }

    pub(crate) fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Invokes a user object and returns the unwrapped payload.
    pub fn process_data(
        &self,
        uo: &UserObject,
        req_type: RequestType,
        user_data: &[u8],
    ) -> HsmResult<Vec<u8>> {
        let resp =
            self.process_data_with(uo, &CallOptions::default(), req_type, &[], user_data)?;
        Ok(resp.protected_data)
    }

    /// AES-encrypts `data` inside the object.
    pub fn encrypt(&self, uo: &UserObject, data: &[u8]) -> HsmResult<Vec<u8>> {
        self.process_data(uo, RequestType::PlainAes, data)
    }

    /// AES-decrypts `data` inside the object.
    pub fn decrypt(&self, uo: &UserObject, data: &[u8]) -> HsmResult<Vec<u8>> {
        self.process_data(uo, RequestType::PlainAesDecrypt, data)
    }

    /// Full-control `ProcessData`: per-call options, plain section, and the
    /// complete parsed response.
    #[instrument(skip_all, fields(uo_id = uo.uo_id(), req_type = %req_type))]
    pub fn process_data_with(
        &self,
        uo: &UserObject,
        opts: &CallOptions,
        req_type: RequestType,
        plain_data: &[u8],
        user_data: &[u8],
    ) -> HsmResult<ProcessDataResp> {
        let nonce = match opts.nonce {
            Some(nonce) => nonce,
            None => gen_nonce()?,
        };

        let wire = ProcessDataReq {
            uo_id: uo.uo_id(),
            enc_key: uo.enc_key(),
            mac_key: uo.mac_key(),
            req_type,
            plain_data,
            user_data,
            nonce,
        }
        .build()?;

        let request = ApiRequest::resolve(
            &self.config,
            Some(uo),
            opts,
            uo.handle().to_string(),
            ApiFunction::ProcessData,
            hex::encode(nonce),
            RequestBody::ProcessData(wire),
        )?;

        let envelope = self.connector.call(&request)?;
        let resp = ProcessDataResp::parse(&envelope, uo.enc_key(), uo.mac_key())?;
        if resp.status != SW_STAT_OK {
            Err(HsmError::ResponseFailed {
                status: resp.status,
                detail: resp.status_detail.clone(),
            })?;
        }
        resp.verify_correlation(uo.uo_id(), &nonce)?;
        Ok(resp)
    }

    /// Fetches the service's RSA import keys.
    #[instrument(skip_all)]
    pub fn get_import_public_keys(&self) -> HsmResult<Vec<ImportKeyRecord>> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or(HsmError::InvalidArgument("api key not configured"))?;
        let nonce = gen_nonce()?;

        let request = ApiRequest::resolve(
            &self.config,
            None,
            &CallOptions::default(),
            api_key,
            ApiFunction::GetImportPublicKey,
            hex::encode(nonce),
            RequestBody::Json(serde_json::json!({})),
        )?;

        let envelope = self.connector.call(&request)?;
        envelope.ensure_ok()?;
        let result = envelope
            .result
            .ok_or(HsmError::Corrupt(CorruptKind::Envelope))?;
        serde_json::from_value(result).map_err(|_| HsmError::Corrupt(CorruptKind::Envelope))
    }

    /// Opens an authentication session against an auth object.
    pub fn auth_session<'a>(
        &'a self,
        uo: &'a UserObject,
        user_id: [u8; USER_ID_LEN],
        user_ctx: Vec<u8>,
    ) -> AuthSession<'a> {
        AuthSession::new(self, uo, user_id, user_ctx)
    }
}

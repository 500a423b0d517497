// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provisioning orchestration.
//!
//! Creating a user object is a two-stage sequence: `GetUserObjectTemplate`
//! fetches the partly-filled image, the filler seals it with client-chosen
//! communication keys, and `CreateUserObject` uploads the result. Each stage
//! runs under its own retry handler; once a stage's budget is spent, the
//! last failure surfaces tagged with the stage number. Cancellation aborts
//! the pending retry delay without sending a spurious request; an in-flight
//! HTTP call is not interrupted, its response is simply discarded.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::instrument;
use zeroize::Zeroizing;

use uohsm_crypto::Rng;

use crate::config::CallOptions;
use crate::error::CorruptKind;
use crate::error::HsmError;
use crate::error::HsmResult;
use crate::error::ProvisionPhase;
use crate::handle::UoHandle;
use crate::nonce::gen_nonce;
use crate::request::ApiFunction;
use crate::request::ApiRequest;
use crate::request::RequestBody;
use crate::retry::CancelHandle;
use crate::retry::RetryHandler;
use crate::retry::RetryPolicy;
use crate::template::fill_template;
use crate::template::TemplateKeys;
use crate::template::UoTemplate;
use crate::uo::HsmClient;
use crate::uo::UserObject;

/// Template request the service consumes verbatim.
///
/// `type` names the object flavour (`PLAINAES`, `RSA2048`, ...); any
/// additional server-understood fields ride in `extra`. Defaults configured
/// under `create_template` are merged in underneath.
#[derive(Clone, Debug, Serialize)]
pub struct TemplateRequest {
    /// Requested object flavour.
    #[serde(rename = "type")]
    pub uo_type: String,

    /// Target environment, when the service distinguishes several.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Additional template-request fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TemplateRequest {
    /// Request for the given object flavour.
    pub fn new(uo_type: impl Into<String>) -> Self {
        Self {
            uo_type: uo_type.into(),
            environment: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// `CreateUserObject` result payload.
#[derive(Debug, Deserialize)]
struct CreateResult {
    handle: String,
    #[serde(default)]
    publickey: Option<String>,
}

/// A freshly provisioned user object.
#[derive(Debug)]
pub struct CreatedUo {
    /// The new object, ready for `ProcessData`.
    pub uo: UserObject,
    /// Public key of RSA objects, as returned by the service.
    pub public_key: Option<Vec<u8>>,
}

/// Cancels both provisioning stages.
#[derive(Clone)]
pub struct ProvisionCancel {
    phase1: CancelHandle,
    phase2: CancelHandle,
}

impl ProvisionCancel {
    /// Aborts the next scheduled attempt of whichever stage is pending.
    pub fn cancel(&self) {
        self.phase1.cancel();
        self.phase2.cancel();
    }
}

/// Two-stage provisioning driver.
pub struct Provisioner<'a> {
    client: &'a HsmClient,
    phase1: RetryHandler,
    phase2: RetryHandler,
}

impl<'a> Provisioner<'a> {
    /// Driver using the client's configured retry policy.
    pub fn new(client: &'a HsmClient) -> Self {
        Self::with_policy(client, client.config().retry())
    }

    /// Driver with an explicit retry policy for both stages.
    pub fn with_policy(client: &'a HsmClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            phase1: RetryHandler::new(policy.clone()),
            phase2: RetryHandler::new(policy),
        }
    }

    /// Handle that cancels the pending stage.
    pub fn cancel_handle(&self) -> ProvisionCancel {
        ProvisionCancel {
            phase1: self.phase1.cancel_handle(),
            phase2: self.phase2.cancel_handle(),
        }
    }

    /// Runs the full sequence and composes the new user-object record.
    ///
    /// `extra_keys` may carry an application or billing key; the four
    /// communication keys are always drawn fresh from the CSPRNG, and the
    /// first two become the new object's transport keys.
    #[instrument(skip_all, fields(uo_type = %request.uo_type))]
    pub fn run(
        &mut self,
        request: &TemplateRequest,
        extra_keys: &TemplateKeys,
    ) -> HsmResult<CreatedUo> {
        let client = self.client;
        let template = self
            .phase1
            .run(|| fetch_template(client, request))
            .map_err(|e| tag(ProvisionPhase::Template, e))?;
        debug!(objectid = %template.objectid, "template received");

        let comm_enc = Zeroizing::new(Rng::rand_key256()?);
        let comm_mac = Zeroizing::new(Rng::rand_key256()?);
        let next_enc = Zeroizing::new(Rng::rand_key256()?);
        let next_mac = Zeroizing::new(Rng::rand_key256()?);
        let keys = extra_keys
            .clone()
            .with_comm_keys(&comm_enc, &comm_mac, &next_enc, &next_mac);

        // An unusable template means stage one delivered garbage.
        let filled =
            fill_template(&template, &keys).map_err(|e| tag(ProvisionPhase::Template, e))?;

        let created = self
            .phase2
            .run(|| create_object(client, &template, &filled.blob, filled.import_key_id))
            .map_err(|e| tag(ProvisionPhase::Import, e))?;

        let handle = UoHandle::parse(&created.handle)
            .map_err(|_| tag(ProvisionPhase::Import, HsmError::Corrupt(CorruptKind::Envelope)))?;
        let endpoint = self
            .client
            .config()
            .process_endpoint
            .clone()
            .ok_or(HsmError::InvalidArgument("no process endpoint configured"))?;

        let public_key = match created.publickey {
            Some(pk) => Some(
                hex::decode(pk)
                    .map_err(|_| tag(ProvisionPhase::Import, HsmError::Corrupt(CorruptKind::Envelope)))?,
            ),
            None => None,
        };

        debug!(handle = %handle, "user object created");
        Ok(CreatedUo {
            uo: UserObject::new(handle, *comm_enc, *comm_mac, endpoint),
            public_key,
        })
    }
}

impl HsmClient {
    /// Provisions a new user object with default retry policy and no extra
    /// keys.
    pub fn create_user_object(&self, request: &TemplateRequest) -> HsmResult<CreatedUo> {
        Provisioner::new(self).run(request, &TemplateKeys::new())
    }
}

fn tag(phase: ProvisionPhase, err: HsmError) -> HsmError {
    match err {
        // Cancellation is the caller's own doing, not a phase failure.
        HsmError::Cancelled => HsmError::Cancelled,
        err => HsmError::Provisioning {
            phase,
            source: Box::new(err),
        },
    }
}

fn fetch_template(client: &HsmClient, request: &TemplateRequest) -> HsmResult<UoTemplate> {
    let api_key = client
        .config()
        .api_key
        .clone()
        .ok_or(HsmError::InvalidArgument("api key not configured"))?;

    // Configured template defaults first, then the request's own fields.
    let mut body = match &client.config().create_template {
        Some(serde_json::Value::Object(defaults)) => defaults.clone(),
        _ => serde_json::Map::new(),
    };
    let request_value =
        serde_json::to_value(request).map_err(|_| HsmError::InvalidArgument("bad template request"))?;
    if let serde_json::Value::Object(fields) = request_value {
        body.extend(fields);
    }

    let nonce = gen_nonce()?;
    let api_request = ApiRequest::resolve(
        client.config(),
        None,
        &CallOptions::default(),
        api_key,
        ApiFunction::GetUserObjectTemplate,
        hex::encode(nonce),
        RequestBody::Json(serde_json::Value::Object(body)),
    )?;

    let envelope = client.connector().call(&api_request)?;
    envelope.ensure_ok()?;
    let result = envelope
        .result
        .ok_or(HsmError::Corrupt(CorruptKind::Envelope))?;
    serde_json::from_value(result).map_err(|_| HsmError::Corrupt(CorruptKind::Envelope))
}

fn create_object(
    client: &HsmClient,
    template: &UoTemplate,
    blob: &[u8],
    import_key_id: i64,
) -> HsmResult<CreateResult> {
    let api_key = client
        .config()
        .api_key
        .clone()
        .ok_or(HsmError::InvalidArgument("api key not configured"))?;

    let body = serde_json::json!({
        "objectid": template.objectid,
        "importkey": import_key_id,
        "object": hex::encode(blob),
        "authorization": template.authorization,
    });

    let nonce = gen_nonce()?;
    let api_request = ApiRequest::resolve(
        client.config(),
        None,
        &CallOptions::default(),
        api_key,
        ApiFunction::CreateUserObject,
        hex::encode(nonce),
        RequestBody::Json(body),
    )?;

    let envelope = client.connector().call(&api_request)?;
    envelope.ensure_ok()?;
    let result = envelope
        .result
        .ok_or(HsmError::Corrupt(CorruptKind::Envelope))?;
    serde_json::from_value(result).map_err(|_| HsmError::Corrupt(CorruptKind::Envelope))
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Client library for the remote user-object HSM service.
//!
//! The service hosts opaque *user objects* (UOs): key-holding entities that
//! perform cryptographic operations (AES, RSA, HMAC, HOTP verification,
//! tokenisation) on client-supplied data. This crate speaks the service's
//! request/response protocol:
//!
//! - [`wire`]: the `ProcessData` envelope, AES-256-CBC encryption with a
//!   zero-IV/nonce convention, CBC-MAC authentication, response-nonce
//!   demangling and strict structural validation
//! - [`template`] / [`provision`]: the two-stage provisioning flow that
//!   fetches an encrypted template, patches client keys into it and uploads
//!   it wrapped under the service's RSA import key
//! - [`auth`]: the HOTP/password verification sub-protocol nested inside
//!   `ProcessData`
//! - [`connector`] / [`retry`]: the HTTP boundary and the cancellable
//!   bounded-retry driver
//!
//! The entry point is [`HsmClient`]; a [`UserObject`] record carries the
//! per-object transport keys.

pub mod auth;
pub mod config;
pub mod connector;
mod error;
pub mod handle;
pub mod nonce;
pub mod provision;
mod request;
pub mod retry;
pub mod template;
mod uo;
pub mod wire;

pub use config::CallOptions;
pub use config::Endpoint;
pub use config::HsmConfig;
pub use config::HttpMethod;
pub use error::CorruptKind;
pub use error::HsmError;
pub use error::HsmResult;
pub use error::ProvisionPhase;
pub use handle::UoHandle;
pub use provision::CreatedUo;
pub use provision::Provisioner;
pub use provision::TemplateRequest;
pub use request::ApiFunction;
pub use request::ApiRequest;
pub use request::RequestBody;
pub use retry::RetryPolicy;
pub use uo::HsmClient;
pub use uo::ImportKeyRecord;
pub use uo::UserObject;
pub use wire::process_data::RequestType;

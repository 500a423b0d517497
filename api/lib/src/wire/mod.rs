// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire formats of the user-object service.
//!
//! The service wraps every call in a small JSON envelope; the interesting
//! payloads (the `ProcessData` frame, templates, import keys) ride inside
//! the `result` field. This module holds the envelope, the status-word
//! table and the `ProcessData` frame codec.

pub mod process_data;
pub mod status;

use serde::Deserialize;
use serde::Serialize;

use crate::error::CorruptKind;
use crate::error::HsmError;
use crate::error::HsmResult;

/// Response envelope common to every service call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseEnvelope {
    /// HSM status word, hex encoded.
    pub status: String,

    /// Human-readable status detail, e.g. `"(OK)SW_STAT_OK"`.
    #[serde(default)]
    pub statusdetail: Option<String>,

    /// Echo of the invoked function name.
    #[serde(default)]
    pub function: Option<String>,

    /// Function-specific payload.
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    /// Protocol version advertised by the service.
    #[serde(default)]
    pub version: Option<String>,
}

impl ResponseEnvelope {
    /// Parses the envelope out of a raw response body.
    pub fn from_json(body: &str) -> HsmResult<Self> {
        serde_json::from_str(body).map_err(|_| HsmError::Corrupt(CorruptKind::Envelope))
    }

    /// Decodes the hex status field.
    pub fn status_word(&self) -> HsmResult<u16> {
        u16::from_str_radix(self.status.trim_start_matches("0x"), 16)
            .map_err(|_| HsmError::Corrupt(CorruptKind::Envelope))
    }

    /// The status detail, or an empty string.
    pub fn detail(&self) -> String {
        self.statusdetail.clone().unwrap_or_default()
    }

    /// Fails with `ResponseFailed` unless the status word is OK.
    pub fn ensure_ok(&self) -> HsmResult<()> {
        let status = self.status_word()?;
        if status != status::SW_STAT_OK {
            Err(HsmError::ResponseFailed {
                status,
                detail: self.detail(),
            })?;
        }
        Ok(())
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for the user-object client.
//!
//! The taxonomy separates caller misuse (`InvalidArgument`), broken wire or
//! crypto invariants (`Corrupt`), transport failures (`Connection`), HSM-side
//! rejections (`ResponseFailed`) and caller-initiated cancellation. The
//! orchestrator additionally tags failures with the provisioning phase they
//! occurred in.

use std::fmt;

use thiserror::Error;
use uohsm_crypto::CryptoError;

/// Result alias used across the crate.
pub type HsmResult<T> = Result<T, HsmError>;

/// Error type for all client operations.
#[derive(Error, Debug)]
pub enum HsmError {
    /// Caller misuse: missing field, bad hex, out-of-range length.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A wire or crypto invariant was broken; no partial data is returned.
    #[error("corrupt response: {0}")]
    Corrupt(CorruptKind),

    /// HTTP transport failure or timeout.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The envelope parsed but the HSM returned a non-OK status.
    #[error("request failed with status {status:#06x} ({detail})")]
    ResponseFailed {
        /// HSM status word.
        status: u16,
        /// `statusdetail` string from the envelope, when present.
        detail: String,
    },

    /// The retry handler was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// Provisioning failed after its retry budget was exhausted.
    #[error("provisioning phase {phase} failed: {source}")]
    Provisioning {
        /// Which provisioning stage failed.
        phase: ProvisionPhase,
        /// The last failure observed in that stage.
        #[source]
        source: Box<HsmError>,
    },

    /// A cryptographic primitive failed.
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

impl HsmError {
    /// True for failures the orchestrator converts into retry triggers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HsmError::Connection(_) | HsmError::Corrupt(_))
    }

    /// Local failure-class code reported alongside HSM status words.
    pub fn local_code(&self) -> Option<u16> {
        match self {
            HsmError::Connection(_) => Some(crate::wire::status::LOCAL_CONNECTION),
            HsmError::ResponseFailed { .. } => Some(crate::wire::status::LOCAL_RESPONSE_FAILED),
            HsmError::Corrupt(_) => Some(crate::wire::status::LOCAL_PARSE_FAILED),
            _ => None,
        }
    }
}

/// What exactly was corrupt about a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptKind {
    /// Authentication tag did not verify.
    MacMismatch,
    /// PKCS#7 or PKCS#1 padding was invalid after decryption.
    Padding,
    /// Decrypted frame did not carry the response flag.
    ResponseFlag,
    /// Echoed freshness nonce did not match the request.
    NonceMismatch,
    /// Echoed user-object id did not match the request.
    UoIdMismatch,
    /// TLV structure was malformed or carried unexpected tags.
    Tlv,
    /// Binary framing (lengths, hex, field boundaries) was inconsistent.
    Framing,
    /// The JSON envelope was missing or malformed.
    Envelope,
    /// Template metadata was inconsistent with its blob.
    Template,
}

impl fmt::Display for CorruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            CorruptKind::MacMismatch => "MAC mismatch",
            CorruptKind::Padding => "invalid padding",
            CorruptKind::ResponseFlag => "response flag mismatch",
            CorruptKind::NonceMismatch => "nonce mismatch",
            CorruptKind::UoIdMismatch => "user-object id mismatch",
            CorruptKind::Tlv => "TLV mismatch",
            CorruptKind::Framing => "framing error",
            CorruptKind::Envelope => "bad envelope",
            CorruptKind::Template => "inconsistent template",
        };
        f.write_str(what)
    }
}

/// Provisioning stage identifier carried by phase-tagged failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProvisionPhase {
    /// `GetUserObjectTemplate`.
    Template = 1,
    /// `CreateUserObject`.
    Import = 2,
}

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Maps decrypt-path crypto failures onto the corrupt taxonomy.
///
/// Padding failures after a verified MAC are still reported as `Corrupt`;
/// everything else stays a crypto failure.
pub(crate) fn corrupt_from_crypto(err: CryptoError) -> HsmError {
    match err {
        CryptoError::AesInvalidPadding => HsmError::Corrupt(CorruptKind::Padding),
        other => HsmError::Crypto(other),
    }
}

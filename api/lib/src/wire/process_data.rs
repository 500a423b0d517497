// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `ProcessData` frame codec.
//!
//! Request frame, before transport:
//!
//! ```text
//! PDIN  = 0x1F || UOid(4, BE) || nonce(8) || userData
//! CT    = AES-256-CBC(encKey, IV = 0, pkcs7(PDIN))
//! TAG   = AES-256-CBC-MAC(macKey, CT)
//! wire  = "Packet0_" || reqType || "_" || hex(plainLen(2, BE) || plainData || CT || TAG)
//! ```
//!
//! The leading nonce occupies the first cipher block, which is why the IV is
//! all-zero. Response frames mirror the request with flag `0xF1` and the
//! nonce incremented per 32-bit word; the parser verifies the MAC before it
//! touches the ciphertext and never returns partial data.

use tracing::trace;
use uohsm_crypto::pkcs7;
use uohsm_crypto::AesCbcAlgo;
use uohsm_crypto::CbcMac;
use uohsm_crypto::AES_BLOCK_SIZE;
use uohsm_crypto::ZERO_IV;

use crate::error::corrupt_from_crypto;
use crate::error::CorruptKind;
use crate::error::HsmError;
use crate::error::HsmResult;
use crate::nonce::demangle_bytes;
use crate::nonce::NONCE_LEN;
use crate::wire::status::SW_STAT_OK;
use crate::wire::ResponseEnvelope;

/// Flag byte opening every request frame.
pub const REQUEST_FLAG: u8 = 0x1F;
/// Flag byte opening every decrypted response frame.
pub const RESPONSE_FLAG: u8 = 0xF1;

/// Wire prefix of every request.
const WIRE_PREFIX: &str = "Packet0_";

/// Symmetric key length enforced by the envelope.
const COMM_KEY_LEN: usize = 32;

/// Request type selecting the user-object operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestType {
    /// AES encryption under the object's application key.
    PlainAes,
    /// AES decryption under the object's application key.
    PlainAesDecrypt,
    /// RSA-1024 private-key operation.
    Rsa1024,
    /// RSA-2048 private-key operation.
    Rsa2048,
    /// HOTP verification sub-protocol.
    AuthHotp,
    /// Password verification sub-protocol.
    AuthPassword,
    /// HMAC computation.
    Hmac,
    /// Tokenisation.
    Tokenize,
    /// De-tokenisation.
    Detokenize,
    /// A server-defined type this client has no name for.
    Other(String),
}

impl RequestType {
    /// The token that appears between the underscores on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            RequestType::PlainAes => "PLAINAES",
            RequestType::PlainAesDecrypt => "PLAINAESDECRYPT",
            RequestType::Rsa1024 => "RSA1024",
            RequestType::Rsa2048 => "RSA2048",
            RequestType::AuthHotp => "AUTH_HOTP",
            RequestType::AuthPassword => "AUTH_PASSWORD",
            RequestType::Hmac => "HMAC",
            RequestType::Tokenize => "TOKENIZE",
            RequestType::Detokenize => "DETOKENIZE",
            RequestType::Other(s) => s,
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PLAINAES" => RequestType::PlainAes,
            "PLAINAESDECRYPT" => RequestType::PlainAesDecrypt,
            "RSA1024" => RequestType::Rsa1024,
            "RSA2048" => RequestType::Rsa2048,
            "AUTH_HOTP" => RequestType::AuthHotp,
            "AUTH_PASSWORD" => RequestType::AuthPassword,
            "HMAC" => RequestType::Hmac,
            "TOKENIZE" => RequestType::Tokenize,
            "DETOKENIZE" => RequestType::Detokenize,
            other => RequestType::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assembles a `ProcessData` request frame.
pub struct ProcessDataReq<'a> {
    /// Target user-object id.
    pub uo_id: u32,
    /// 256-bit transport encryption key.
    pub enc_key: &'a [u8],
    /// 256-bit transport MAC key.
    pub mac_key: &'a [u8],
    /// Operation selector.
    pub req_type: RequestType,
    /// Unprotected data rides in front of the ciphertext.
    pub plain_data: &'a [u8],
    /// Data protected by the envelope.
    pub user_data: &'a [u8],
    /// Freshness nonce; also the correlation key for the response.
    pub nonce: [u8; NONCE_LEN],
}

impl<'a> ProcessDataReq<'a> {
    /// Serializes the frame into its wire string.
    pub fn build(&self) -> HsmResult<String> {
        if self.enc_key.len() != COMM_KEY_LEN || self.mac_key.len() != COMM_KEY_LEN {
            Err(HsmError::InvalidArgument("comm keys must be 256-bit"))?;
        }
        if self.plain_data.len() > u16::MAX as usize {
            Err(HsmError::InvalidArgument("plain data exceeds 16-bit length"))?;
        }

        let mut pdin = Vec::with_capacity(1 + 4 + NONCE_LEN + self.user_data.len());
        pdin.push(REQUEST_FLAG);
        pdin.extend_from_slice(&self.uo_id.to_be_bytes());
        pdin.extend_from_slice(&self.nonce);
        pdin.extend_from_slice(self.user_data);

        let padded = pkcs7::pad(&pdin, AES_BLOCK_SIZE);
        let ct = AesCbcAlgo::with_no_padding(ZERO_IV).encrypt(self.enc_key, &padded)?;
        let tag = CbcMac::compute(self.mac_key, &ct)?;

        let mut wire = String::with_capacity(
            WIRE_PREFIX.len()
                + self.req_type.as_str().len()
                + 1
                + 2 * (2 + self.plain_data.len() + ct.len() + tag.len()),
        );
        wire.push_str(WIRE_PREFIX);
        wire.push_str(self.req_type.as_str());
        wire.push('_');
        wire.push_str(&hex::encode((self.plain_data.len() as u16).to_be_bytes()));
        wire.push_str(&hex::encode(self.plain_data));
        wire.push_str(&hex::encode(&ct));
        wire.push_str(&hex::encode(tag));

        trace!(uo_id = self.uo_id, req_type = %self.req_type, "built ProcessData frame");
        Ok(wire)
    }
}

/// Parsed `ProcessData` response.
#[derive(Debug, Clone, Default)]
pub struct ProcessDataResp {
    /// HSM status word; fields below are empty unless it is OK.
    pub status: u16,
    /// Status detail string from the envelope.
    pub status_detail: String,
    /// Unprotected section of the response body.
    pub plain_data: Vec<u8>,
    /// Echoed user-object id.
    pub uo_id: u32,
    /// Demangled freshness nonce.
    pub nonce: [u8; NONCE_LEN],
    /// Decrypted payload.
    pub protected_data: Vec<u8>,
}

impl ProcessDataResp {
    /// Parses and authenticates a response envelope.
    ///
    /// The steps run in a fixed order and any failure is fatal: envelope
    /// status, framing, MAC verification, decryption, flag check, field
    /// extraction. MAC verification precedes decryption so a padding failure
    /// can never act as an oracle.
    pub fn parse(
        envelope: &ResponseEnvelope,
        enc_key: &[u8],
        mac_key: &[u8],
    ) -> HsmResult<ProcessDataResp> {
        let status = envelope.status_word()?;
        if status != SW_STAT_OK {
            // Error envelopes carry no frame; surface the status as-is.
            return Ok(ProcessDataResp {
                status,
                status_detail: envelope.detail(),
                ..Default::default()
            });
        }

        let result = match envelope.result.as_ref().and_then(|v| v.as_str()) {
            Some(s) => s,
            None => Err(HsmError::Corrupt(CorruptKind::Envelope))?,
        };
        let head = result.split('_').next().unwrap_or("");
        let body = hex::decode(head).map_err(|_| HsmError::Corrupt(CorruptKind::Framing))?;

        // plainLen(2) || plain || CT (>= 1 block) || TAG(16)
        if body.len() < 2 {
            Err(HsmError::Corrupt(CorruptKind::Framing))?;
        }
        let plain_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let ct_end = body
            .len()
            .checked_sub(AES_BLOCK_SIZE)
            .filter(|&end| end >= 2 + plain_len + AES_BLOCK_SIZE)
            .ok_or(HsmError::Corrupt(CorruptKind::Framing))?;
        let plain_data = body[2..2 + plain_len].to_vec();
        let ct = &body[2 + plain_len..ct_end];
        let tag = &body[ct_end..];
        if ct.len() % AES_BLOCK_SIZE != 0 {
            Err(HsmError::Corrupt(CorruptKind::Framing))?;
        }

        if !CbcMac::verify(mac_key, ct, tag)? {
            Err(HsmError::Corrupt(CorruptKind::MacMismatch))?;
        }

        let dec = AesCbcAlgo::with_padding(ZERO_IV)
            .decrypt(enc_key, ct)
            .map_err(corrupt_from_crypto)?;

        if dec.first() != Some(&RESPONSE_FLAG) {
            Err(HsmError::Corrupt(CorruptKind::ResponseFlag))?;
        }
        if dec.len() < 1 + 4 + NONCE_LEN {
            Err(HsmError::Corrupt(CorruptKind::Framing))?;
        }

        let uo_id = u32::from_be_bytes([dec[1], dec[2], dec[3], dec[4]]);
        let mut mangled = [0u8; NONCE_LEN];
        mangled.copy_from_slice(&dec[5..5 + NONCE_LEN]);

        Ok(ProcessDataResp {
            status,
            status_detail: envelope.detail(),
            plain_data,
            uo_id,
            nonce: demangle_bytes(&mangled),
            protected_data: dec[1 + 4 + NONCE_LEN..].to_vec(),
        })
    }

    /// Ties the response back to its request.
    ///
    /// The freshness nonce is the correlation key; the echoed object id is
    /// checked as well.
    pub fn verify_correlation(&self, uo_id: u32, nonce: &[u8; NONCE_LEN]) -> HsmResult<()> {
        if self.uo_id != uo_id {
            Err(HsmError::Corrupt(CorruptKind::UoIdMismatch))?;
        }
        if &self.nonce != nonce {
            Err(HsmError::Corrupt(CorruptKind::NonceMismatch))?;
        }
        Ok(())
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! User-authentication sub-protocol (HOTP and password).
//!
//! Authentication rides on top of `ProcessData` as a nested TLV language.
//! The HSM hands the caller an encrypted, authenticated *user context* blob;
//! every auth call presents the current context and receives a fresh one,
//! which the caller must persist. That includes failed attempts, because the
//! HSM has updated the failure counters inside.
//!
//! Outer tags: `0xA3` user context, `0xA8` new context, `0xA7` context
//! update, `0xA5` HOTP verification, `0xA4` password verification. Method
//! records inside a context: `0x3F` HOTP, `0x40` password, `0x3E` global
//! tries. All lengths are 16-bit big-endian.

use zeroize::Zeroizing;

use uohsm_crypto::format_code;
use uohsm_crypto::AesCbcAlgo;
use uohsm_crypto::CbcMac;
use uohsm_crypto::Rng;
use uohsm_crypto::ZERO_IV;

use crate::error::CorruptKind;
use crate::error::HsmError;
use crate::error::HsmResult;
use crate::uo::HsmClient;
use crate::uo::UserObject;
use crate::wire::process_data::RequestType;
use crate::wire::status::SW_STAT_OK;

/// Outer tag carrying the user context.
pub const TAG_USER_CTX: u8 = 0xA3;
/// Outer tag carrying a freshly built plaintext context.
pub const TAG_NEW_CTX: u8 = 0xA8;
/// Outer tag of a context-update operation.
pub const TAG_UPDATE_CTX: u8 = 0xA7;
/// Outer tag of an HOTP verification.
pub const TAG_HOTP_VERIFY: u8 = 0xA5;
/// Outer tag of a password verification.
pub const TAG_PASSWD_VERIFY: u8 = 0xA4;

const METHOD_HOTP: u8 = 0x3F;
const METHOD_PASSWD: u8 = 0x40;
const METHOD_GLOBAL_TRIES: u8 = 0x3E;

/// User id length inside the TLV bodies.
pub const USER_ID_LEN: usize = 8;

/// HOTP secrets occupy a fixed 16-byte slot in the context.
pub const HOTP_SECRET_SLOT: usize = 16;

/// One authentication method stored in a user context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// RFC 4226 counter-based one-time passwords.
    Hotp {
        /// Moving counter.
        counter: u64,
        /// Consecutive failures so far.
        current_fails: u8,
        /// Failure budget of this method.
        max_fails: u8,
        /// Code length in digits.
        digits: u8,
        /// Shared secret, left-aligned in its slot.
        secret: Vec<u8>,
    },
    /// Static password hash comparison.
    Password {
        /// Consecutive failures so far.
        current_fails: u8,
        /// Failure budget of this method.
        max_fails: u8,
        /// Password hash.
        hash: Vec<u8>,
    },
    /// Remaining global tries across all methods.
    GlobalTries {
        /// Tries left.
        tries: u8,
    },
}

impl AuthMethod {
    fn record_type(&self) -> u8 {
        match self {
            AuthMethod::Hotp { .. } => METHOD_HOTP,
            AuthMethod::Password { .. } => METHOD_PASSWD,
            AuthMethod::GlobalTries { .. } => METHOD_GLOBAL_TRIES,
        }
    }

    /// Serializes the method as a `type || len || body` record.
    pub fn encode_record(&self) -> HsmResult<Vec<u8>> {
        let body = match self {
            AuthMethod::Hotp {
                counter,
                current_fails,
                max_fails,
                digits,
                secret,
            } => {
                if secret.len() > HOTP_SECRET_SLOT {
                    Err(HsmError::InvalidArgument("HOTP secret exceeds its slot"))?;
                }
                let mut body = Vec::with_capacity(12 + HOTP_SECRET_SLOT);
                body.extend_from_slice(&counter.to_be_bytes());
                body.push(*current_fails);
                body.push(*max_fails);
                body.push(*digits);
                body.push(secret.len() as u8);
                body.extend_from_slice(secret);
                body.resize(12 + HOTP_SECRET_SLOT, 0x00);
                body
            }
            AuthMethod::Password {
                current_fails,
                max_fails,
                hash,
            } => {
                if hash.len() > u8::MAX as usize {
                    Err(HsmError::InvalidArgument("password hash too long"))?;
                }
                let mut body = Vec::with_capacity(3 + hash.len());
                body.push(*current_fails);
                body.push(*max_fails);
                body.push(hash.len() as u8);
                body.extend_from_slice(hash);
                body
            }
            AuthMethod::GlobalTries { tries } => vec![*tries],
        };
        Ok(tlv(self.record_type(), &body))
    }

    fn decode_record(record_type: u8, body: &[u8]) -> HsmResult<AuthMethod> {
        match record_type {
            METHOD_HOTP => {
                if body.len() != 12 + HOTP_SECRET_SLOT {
                    Err(HsmError::Corrupt(CorruptKind::Tlv))?;
                }
                let counter = u64::from_be_bytes(body[..8].try_into().expect("8 bytes"));
                let secret_len = body[11] as usize;
                if secret_len > HOTP_SECRET_SLOT {
                    Err(HsmError::Corrupt(CorruptKind::Tlv))?;
                }
                Ok(AuthMethod::Hotp {
                    counter,
                    current_fails: body[8],
                    max_fails: body[9],
                    digits: body[10],
                    secret: body[12..12 + secret_len].to_vec(),
                })
            }
            METHOD_PASSWD => {
                if body.len() < 3 {
                    Err(HsmError::Corrupt(CorruptKind::Tlv))?;
                }
                let hash_len = body[2] as usize;
                if body.len() != 3 + hash_len {
                    Err(HsmError::Corrupt(CorruptKind::Tlv))?;
                }
                Ok(AuthMethod::Password {
                    current_fails: body[0],
                    max_fails: body[1],
                    hash: body[3..].to_vec(),
                })
            }
            METHOD_GLOBAL_TRIES => {
                if body.len() != 1 {
                    Err(HsmError::Corrupt(CorruptKind::Tlv))?;
                }
                Ok(AuthMethod::GlobalTries { tries: body[0] })
            }
            _ => Err(HsmError::Corrupt(CorruptKind::Tlv)),
        }
    }
}

/// Plaintext authentication context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    /// Format version.
    pub version: u8,
    /// User the context belongs to.
    pub user_id: [u8; USER_ID_LEN],
    /// Context flags.
    pub flags: u32,
    /// Failures across all methods.
    pub total_fails: u8,
    /// Failure budget across all methods.
    pub max_fails: u8,
    /// Enrolled methods.
    pub methods: Vec<AuthMethod>,
}

impl AuthContext {
    /// Serializes header and method records.
    pub fn encode(&self) -> HsmResult<Vec<u8>> {
        let mut out = Vec::with_capacity(15 + self.methods.len() * 32);
        out.push(self.version);
        out.extend_from_slice(&self.user_id);
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.push(self.total_fails);
        out.push(self.max_fails);
        for method in &self.methods {
            out.extend_from_slice(&method.encode_record()?);
        }
        Ok(out)
    }

    /// Parses a plaintext context; strict about lengths and record types.
    pub fn decode(data: &[u8]) -> HsmResult<AuthContext> {
        if data.len() < 15 {
            Err(HsmError::Corrupt(CorruptKind::Tlv))?;
        }
        let mut user_id = [0u8; USER_ID_LEN];
        user_id.copy_from_slice(&data[1..9]);
        let flags = u32::from_be_bytes(data[9..13].try_into().expect("4 bytes"));

        let mut methods = Vec::new();
        let mut pos = 15;
        while pos < data.len() {
            let (tag, body, next) = read_tlv(data, pos)?;
            methods.push(AuthMethod::decode_record(tag, body)?);
            pos = next;
        }

        Ok(AuthContext {
            version: data[0],
            user_id,
            flags,
            total_fails: data[13],
            max_fails: data[14],
            methods,
        })
    }
}

/// Verification operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOp {
    /// HOTP verification, tag `0xA5`.
    Hotp,
    /// Password verification, tag `0xA4`.
    Password,
}

impl AuthOp {
    fn tag(self) -> u8 {
        match self {
            AuthOp::Hotp => TAG_HOTP_VERIFY,
            AuthOp::Password => TAG_PASSWD_VERIFY,
        }
    }

    fn request_type(self) -> RequestType {
        match self {
            AuthOp::Hotp => RequestType::AuthHotp,
            AuthOp::Password => RequestType::AuthPassword,
        }
    }
}

/// Builds the enrollment blob for a brand-new context.
///
/// The protected copy is encrypted and MACed under one-shot random keys
/// that are discarded afterwards; the HSM re-protects the context under its
/// own keys before returning it.
pub fn build_new_context(ctx: &AuthContext) -> HsmResult<Vec<u8>> {
    let ctx_bytes = ctx.encode()?;

    let ke = Zeroizing::new(Rng::rand_key256()?);
    let km = Zeroizing::new(Rng::rand_key256()?);
    let ct = AesCbcAlgo::with_padding(ZERO_IV).encrypt(ke.as_ref(), &ctx_bytes)?;
    let mac = CbcMac::compute(km.as_ref(), &ct)?;

    let mut protected = ct;
    protected.extend_from_slice(&mac);

    let mut out = tlv(TAG_USER_CTX, &protected);
    out.extend_from_slice(&tlv(TAG_NEW_CTX, &ctx_bytes));
    Ok(out)
}

/// Builds a verification blob: context, then `user_id || code` under the
/// operation tag.
pub fn build_auth(
    user_id: &[u8; USER_ID_LEN],
    code: &[u8],
    user_ctx: &[u8],
    op: AuthOp,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(USER_ID_LEN + code.len());
    body.extend_from_slice(user_id);
    body.extend_from_slice(code);

    let mut out = tlv(TAG_USER_CTX, user_ctx);
    out.extend_from_slice(&tlv(op.tag(), &body));
    out
}

/// Builds a context-update blob carrying one replacement method record.
pub fn build_update(
    user_id: &[u8; USER_ID_LEN],
    user_ctx: &[u8],
    method: &AuthMethod,
) -> HsmResult<Vec<u8>> {
    let mut body = Vec::with_capacity(USER_ID_LEN + 32);
    body.extend_from_slice(user_id);
    body.extend_from_slice(&method.encode_record()?);

    let mut out = tlv(TAG_USER_CTX, user_ctx);
    out.extend_from_slice(&tlv(TAG_UPDATE_CTX, &body));
    Ok(out)
}

/// Parsed authentication response.
#[derive(Debug, Clone)]
pub struct AuthResponse {
    /// Fresh protected context; persist it, even after a failed attempt.
    pub user_ctx: Vec<u8>,
    /// Echoed user id.
    pub user_id: [u8; USER_ID_LEN],
    /// Raw per-method return blocks, when the operation produced any.
    pub method_data: Vec<u8>,
    /// Sub-protocol status word.
    pub status: u16,
    /// Set once parsing succeeded; the context above is safe to persist.
    pub should_update_ctx: bool,
}

/// Parses the TLV response of a verification or update call.
///
/// Strict: the outer tag must be the user context, the inner tag must be
/// exactly the requested operation, and nothing may trail the second TLV.
pub fn parse_auth_response(data: &[u8], expected_tag: u8) -> HsmResult<AuthResponse> {
    let (tag, user_ctx, pos) = read_tlv(data, 0)?;
    if tag != TAG_USER_CTX {
        Err(HsmError::Corrupt(CorruptKind::Tlv))?;
    }
    let user_ctx = user_ctx.to_vec();

    let (tag, body, end) = read_tlv(data, pos)?;
    if tag != expected_tag || end != data.len() {
        Err(HsmError::Corrupt(CorruptKind::Tlv))?;
    }
    if body.len() < USER_ID_LEN + 2 {
        Err(HsmError::Corrupt(CorruptKind::Tlv))?;
    }

    let mut user_id = [0u8; USER_ID_LEN];
    user_id.copy_from_slice(&body[..USER_ID_LEN]);
    let status = u16::from_be_bytes([body[body.len() - 2], body[body.len() - 1]]);

    Ok(AuthResponse {
        user_ctx,
        user_id,
        method_data: body[USER_ID_LEN..body.len() - 2].to_vec(),
        status,
        should_update_ctx: true,
    })
}

/// Authentication session states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// No request in flight.
    Idle,
    /// Request built and handed to the connector.
    RequestSent,
    /// Envelope arrived; TLV not yet interpreted.
    ResponseReceived,
    /// Last verification succeeded.
    AuthOk,
    /// Last verification was rejected by the HSM.
    AuthFailed,
    /// Last response failed TLV parsing.
    Corrupt,
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// Sub-protocol status word; `0x9000` on success.
    pub status: u16,
    /// Convenience flag for `status == SW_STAT_OK`.
    pub ok: bool,
}

/// Drives verification calls for one user against one auth object.
///
/// The session owns the evolving user context. After every completed call
/// the fresh context replaces the stored one, also on auth failure, where
/// the HSM has advanced its failure counters.
pub struct AuthSession<'a> {
    client: &'a HsmClient,
    uo: &'a UserObject,
    user_id: [u8; USER_ID_LEN],
    user_ctx: Vec<u8>,
    state: AuthState,
}

impl<'a> AuthSession<'a> {
    pub(crate) fn new(
        client: &'a HsmClient,
        uo: &'a UserObject,
        user_id: [u8; USER_ID_LEN],
        user_ctx: Vec<u8>,
    ) -> Self {
        Self {
            client,
            uo,
            user_id,
            user_ctx,
            state: AuthState::Idle,
        }
    }

    /// Current session state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// The context to persist for the next session.
    pub fn user_ctx(&self) -> &[u8] {
        &self.user_ctx
    }

    /// Verifies an HOTP code.
    pub fn verify_hotp(&mut self, code: u32, digits: u32) -> HsmResult<AuthOutcome> {
        let code = format_code(code, digits);
        self.verify(code.as_bytes(), AuthOp::Hotp)
    }

    /// Verifies a password hash.
    pub fn verify_password(&mut self, hash: &[u8]) -> HsmResult<AuthOutcome> {
        self.verify(hash, AuthOp::Password)
    }

    /// Replaces one method record in the context.
    pub fn update_method(&mut self, method: &AuthMethod) -> HsmResult<AuthOutcome> {
        let blob = build_update(&self.user_id, &self.user_ctx, method)?;
        self.round_trip(&blob, RequestType::AuthHotp, TAG_UPDATE_CTX)
    }

    fn verify(&mut self, code: &[u8], op: AuthOp) -> HsmResult<AuthOutcome> {
        let blob = build_auth(&self.user_id, code, &self.user_ctx, op);
        self.round_trip(&blob, op.request_type(), op.tag())
    }

    fn round_trip(
        &mut self,
        blob: &[u8],
        req_type: RequestType,
        expected_tag: u8,
    ) -> HsmResult<AuthOutcome> {
        self.state = AuthState::RequestSent;
        let protected = match self.client.process_data(self.uo, req_type, blob) {
            Ok(data) => data,
            Err(err) => {
                self.state = AuthState::Idle;
                return Err(err);
            }
        };
        self.state = AuthState::ResponseReceived;

        let resp = match parse_auth_response(&protected, expected_tag) {
            Ok(resp) => resp,
            Err(err) => {
                self.state = AuthState::Corrupt;
                return Err(err);
            }
        };
        if resp.user_id != self.user_id {
            self.state = AuthState::Corrupt;
            Err(HsmError::Corrupt(CorruptKind::Tlv))?;
        }

        // The HSM updated the context either way; keep the fresh copy.
        self.user_ctx = resp.user_ctx;
        let ok = resp.status == SW_STAT_OK;
        self.state = if ok { AuthState::AuthOk } else { AuthState::AuthFailed };
        Ok(AuthOutcome {
            status: resp.status,
            ok,
        })
    }
}

/// `tag || len(2, BE) || body`.
fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(tag);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Reads one TLV at `pos`; returns `(tag, body, next_pos)`.
fn read_tlv(data: &[u8], pos: usize) -> HsmResult<(u8, &[u8], usize)> {
    if pos + 3 > data.len() {
        Err(HsmError::Corrupt(CorruptKind::Tlv))?;
    }
    let tag = data[pos];
    let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
    let start = pos + 3;
    if start + len > data.len() {
        Err(HsmError::Corrupt(CorruptKind::Tlv))?;
    }
    Ok((tag, &data[start..start + len], start + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotp_context() -> AuthContext {
        AuthContext {
            version: 1,
            user_id: *b"user0001",
            flags: 0,
            total_fails: 0,
            max_fails: 5,
            methods: vec![AuthMethod::Hotp {
                counter: 1,
                current_fails: 0,
                max_fails: 3,
                digits: 6,
                secret: b"12345678901234567890"[..16].to_vec(),
            }],
        }
    }

    #[test]
    fn test_context_round_trip() {
        let ctx = AuthContext {
            methods: vec![
                AuthMethod::Hotp {
                    counter: 0xDEADBEEF,
                    current_fails: 1,
                    max_fails: 3,
                    digits: 8,
                    secret: vec![0xAB; 16],
                },
                AuthMethod::Password {
                    current_fails: 0,
                    max_fails: 5,
                    hash: vec![0x55; 20],
                },
                AuthMethod::GlobalTries { tries: 9 },
            ],
            ..hotp_context()
        };
        let encoded = ctx.encode().unwrap();
        assert_eq!(AuthContext::decode(&encoded).unwrap(), ctx);
    }

    #[test]
    fn test_context_decode_strict() {
        let ctx = hotp_context();
        let mut encoded = ctx.encode().unwrap();
        // Truncated record.
        encoded.pop();
        assert!(matches!(
            AuthContext::decode(&encoded),
            Err(HsmError::Corrupt(CorruptKind::Tlv))
        ));
        // Unknown method type.
        let mut encoded = ctx.encode().unwrap();
        encoded[15] = 0x7E;
        assert!(matches!(
            AuthContext::decode(&encoded),
            Err(HsmError::Corrupt(CorruptKind::Tlv))
        ));
        // Header shorter than the fixed fields.
        assert!(AuthContext::decode(&[0u8; 14]).is_err());
    }

    #[test]
    fn test_hotp_record_slot_padding() {
        let method = AuthMethod::Hotp {
            counter: 2,
            current_fails: 0,
            max_fails: 3,
            digits: 6,
            secret: vec![0x11; 10],
        };
        let record = method.encode_record().unwrap();
        // type || len || 8 + 4 fixed || 16-byte slot
        assert_eq!(record.len(), 3 + 12 + HOTP_SECRET_SLOT);
        assert_eq!(record[0], METHOD_HOTP);
        let (tag, body, _) = read_tlv(&record, 0).unwrap();
        assert_eq!(tag, METHOD_HOTP);
        let decoded = AuthMethod::decode_record(tag, body).unwrap();
        assert_eq!(decoded, method);
    }

    #[test]
    fn test_build_new_context_shape() {
        let ctx = hotp_context();
        let blob = build_new_context(&ctx).unwrap();
        let (tag, protected, pos) = read_tlv(&blob, 0).unwrap();
        assert_eq!(tag, TAG_USER_CTX);
        // Ciphertext plus a 16-byte tag, all block-aligned.
        assert!(protected.len() > 16 && protected.len() % 16 == 0);
        let (tag, plain, end) = read_tlv(&blob, pos).unwrap();
        assert_eq!(tag, TAG_NEW_CTX);
        assert_eq!(end, blob.len());
        assert_eq!(AuthContext::decode(plain).unwrap(), ctx);
    }

    #[test]
    fn test_build_auth_layout() {
        let ctx_blob = vec![0xC7; 48];
        let blob = build_auth(b"user0001", b"287082", &ctx_blob, AuthOp::Hotp);
        let (tag, ctx, pos) = read_tlv(&blob, 0).unwrap();
        assert_eq!(tag, TAG_USER_CTX);
        assert_eq!(ctx, &ctx_blob[..]);
        let (tag, body, end) = read_tlv(&blob, pos).unwrap();
        assert_eq!(tag, TAG_HOTP_VERIFY);
        assert_eq!(end, blob.len());
        assert_eq!(&body[..8], b"user0001");
        assert_eq!(&body[8..], b"287082");
    }

    #[test]
    fn test_parse_auth_response_round_trip() {
        let fresh_ctx = vec![0x2E; 64];
        let mut inner = b"user0001".to_vec();
        inner.extend_from_slice(&0xA0B0u16.to_be_bytes());
        let mut data = tlv(TAG_USER_CTX, &fresh_ctx);
        data.extend_from_slice(&tlv(TAG_HOTP_VERIFY, &inner));

        let resp = parse_auth_response(&data, TAG_HOTP_VERIFY).unwrap();
        assert_eq!(resp.user_ctx, fresh_ctx);
        assert_eq!(&resp.user_id, b"user0001");
        assert_eq!(resp.status, 0xA0B0);
        assert!(resp.method_data.is_empty());
        assert!(resp.should_update_ctx);
    }

    #[test]
    fn test_parse_auth_response_strict() {
        let inner = {
            let mut v = b"user0001".to_vec();
            v.extend_from_slice(&0x9000u16.to_be_bytes());
            v
        };
        // Wrong outer tag.
        let mut data = tlv(TAG_NEW_CTX, &[0u8; 8]);
        data.extend_from_slice(&tlv(TAG_HOTP_VERIFY, &inner));
        assert!(parse_auth_response(&data, TAG_HOTP_VERIFY).is_err());

        // Wrong inner op tag.
        let mut data = tlv(TAG_USER_CTX, &[0u8; 8]);
        data.extend_from_slice(&tlv(TAG_PASSWD_VERIFY, &inner));
        assert!(parse_auth_response(&data, TAG_HOTP_VERIFY).is_err());

        // Trailing bytes.
        let mut data = tlv(TAG_USER_CTX, &[0u8; 8]);
        data.extend_from_slice(&tlv(TAG_HOTP_VERIFY, &inner));
        data.push(0x00);
        assert!(parse_auth_response(&data, TAG_HOTP_VERIFY).is_err());

        // Body too short for user id and status.
        let mut data = tlv(TAG_USER_CTX, &[0u8; 8]);
        data.extend_from_slice(&tlv(TAG_HOTP_VERIFY, &[0u8; 9]));
        assert!(parse_auth_response(&data, TAG_HOTP_VERIFY).is_err());
    }
}

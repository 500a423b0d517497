// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loopback service emulation for integration tests.
//!
//! [`LoopbackHsm`] implements the transport trait and answers like the real
//! service: it keeps a registry of user objects with their comm keys,
//! decrypts and verifies incoming `ProcessData` frames, mirrors them with
//! the response flag and the incremented nonce, serves templates, and
//! unwraps uploaded template blobs with its import RSA key. Auth objects
//! verify HOTP codes against the presented context, exactly like the HSM's
//! failure-counter behaviour.

// Each test binary compiles its own copy; not all of them use every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use uohsm_api::auth::AuthContext;
use uohsm_api::auth::AuthMethod;
use uohsm_api::connector::HttpTransport;
use uohsm_api::connector::TransportError;
use uohsm_api::connector::TransportReply;
use uohsm_api::nonce::mangle;
use uohsm_api::Endpoint;
use uohsm_api::HsmClient;
use uohsm_api::HsmConfig;
use uohsm_api::UoHandle;
use uohsm_api::UserObject;
use uohsm_crypto::hotp;
use uohsm_crypto::pkcs7;
use uohsm_crypto::AesCbcAlgo;
use uohsm_crypto::BitVec;
use uohsm_crypto::CbcMac;
use uohsm_crypto::ZERO_IV;

pub const API_KEY: &str = "TEST_API";
pub const TEMPLATE_OBJECT_ID: u32 = 0x0000EE42;

/// Flag bits in the sample template's flag byte.
const FLAG_GENERATE_COMM_KEYS: u8 = 0x08;

const TAG_USER_CTX: u8 = 0xA3;
const TAG_HOTP_VERIFY: u8 = 0xA5;
const TAG_WRAPPED_KEYS: u8 = 0xA1;
const TAG_TEMPLATE_IMAGE: u8 = 0xA2;

const SW_OK: u16 = 0x9000;
const SW_HOTP_WRONG: u16 = 0xA0B0;
const SW_HOTP_TOO_MANY: u16 = 0xA0B1;

pub struct UoEntry {
    pub enc: [u8; 32],
    pub mac: [u8; 32],
}

struct State {
    uos: HashMap<u32, UoEntry>,
    rsa: openssl::rsa::Rsa<openssl::pkey::Private>,
    next_uo_id: u32,
    /// Requests to let through before `fail_next` starts biting.
    fail_after: u32,
    /// Remaining requests to fail with a timeout.
    fail_next: u32,
    /// Flip a tag nibble in the next ProcessData response.
    tamper_next: bool,
    /// Template slot layout: 4-byte prefix, one 256-bit comm-enc slot,
    /// one 256-bit comm-mac slot, 12 bytes of tail.
    created: Vec<u32>,
}

pub struct LoopbackHsm {
    state: Mutex<State>,
}

impl LoopbackHsm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                uos: HashMap::new(),
                rsa: openssl::rsa::Rsa::generate(2048).unwrap(),
                next_uo_id: 0x1000,
                fail_after: 0,
                fail_next: 0,
                tamper_next: false,
                created: Vec::new(),
            }),
        })
    }

    /// Registers an object with known keys; returns its record.
    pub fn register_uo(self: &Arc<Self>, uo_id: u32, enc: [u8; 32], mac: [u8; 32]) -> UserObject {
        self.state.lock().uos.insert(uo_id, UoEntry { enc, mac });
        UserObject::new(
            UoHandle::new(API_KEY, uo_id, 0),
            enc,
            mac,
            Endpoint::new("loopback.test"),
        )
    }

    /// Fails the next `n` requests with a timeout.
    pub fn fail_next(self: &Arc<Self>, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Lets `skip` requests through, then fails the following `n`.
    #[allow(dead_code)]
    pub fn fail_after_next(self: &Arc<Self>, skip: u32, n: u32) {
        let mut state = self.state.lock();
        state.fail_after = skip;
        state.fail_next = n;
    }

    /// Drops an object from the registry.
    #[allow(dead_code)]
    pub fn forget_uo(self: &Arc<Self>, uo_id: u32) {
        self.state.lock().uos.remove(&uo_id);
    }

    /// Corrupts the tag of the next ProcessData response.
    pub fn tamper_next(self: &Arc<Self>) {
        self.state.lock().tamper_next = true;
    }

    pub fn created_count(self: &Arc<Self>) -> usize {
        self.state.lock().created.len()
    }

    /// A client wired to this loopback.
    pub fn client(self: &Arc<Self>) -> HsmClient {
        let mut config = HsmConfig::for_host("loopback.test");
        config.api_key = Some(API_KEY.to_string());
        HsmClient::with_transport(config, self.clone())
    }

    fn dispatch(&self, url: &str, body: Option<&serde_json::Value>) -> Result<TransportReply, TransportError> {
        let mut state = self.state.lock();
        if state.fail_after > 0 {
            state.fail_after -= 1;
        } else if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Timeout);
        }

        // {scheme}://{host}:{port}/{ver}/{handle}/{function}/{nonce}[/{data}]
        let segments: Vec<&str> = url.splitn(2, "//").nth(1).unwrap().split('/').collect();
        let handle = segments[2];
        let function = segments[3];

        let body_json = match (body, segments.get(5)) {
            (Some(body), _) => body.clone(),
            (None, Some(data)) if function == "ProcessData" => {
                serde_json::json!({ "data": data })
            }
            (None, Some(data)) => serde_json::from_str(data).unwrap(),
            (None, None) => serde_json::json!({}),
        };

        let reply = match function {
            "ProcessData" => self.process_data(&mut state, handle, &body_json),
            "GetUserObjectTemplate" => self.get_template(&state),
            "CreateUserObject" => self.create_object(&mut state, &body_json),
            "GetImportPublicKey" => self.get_import_keys(&state),
            other => panic!("unexpected function {}", other),
        };
        Ok(TransportReply {
            status: 200,
            body: reply.to_string(),
        })
    }

    fn process_data(
        &self,
        state: &mut State,
        handle: &str,
        body: &serde_json::Value,
    ) -> serde_json::Value {
        let parsed = UoHandle::parse(handle).unwrap();
        let entry = match state.uos.get(&parsed.uo_id) {
            Some(entry) => entry,
            None => return error_envelope(0x8068, "(ERR)SW_INVALID_API_KEY"),
        };

        let wire = body["data"].as_str().unwrap();
        let rest = wire.strip_prefix("Packet0_").unwrap();
        let (req_type, hex_body) = rest.rsplit_once('_').unwrap();
        let req_type = req_type.to_string();

        let frame = hex::decode(hex_body).unwrap();
        let plain_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let ct = &frame[2 + plain_len..frame.len() - 16];
        let tag = &frame[frame.len() - 16..];
        if !CbcMac::verify(&entry.mac, ct, tag).unwrap() {
            return error_envelope(0x6F00, "(ERR)SW_GENERIC");
        }
        let pdin = AesCbcAlgo::with_padding(ZERO_IV).decrypt(&entry.enc, ct).unwrap();
        assert_eq!(pdin[0], 0x1F, "request flag");
        let uo_id = u32::from_be_bytes(pdin[1..5].try_into().unwrap());
        let nonce: [u8; 8] = pdin[5..13].try_into().unwrap();
        let user_data = &pdin[13..];

        let (status, protected): (u16, Vec<u8>) = match req_type.as_str() {
            // The loopback's AES objects echo the payload.
            "PLAINAES" | "PLAINAESDECRYPT" => (SW_OK, user_data.to_vec()),
            "AUTH_HOTP" => (SW_OK, verify_hotp_blob(user_data)),
            other => panic!("unexpected request type {}", other),
        };

        if status != SW_OK {
            return error_envelope(status, "(ERR)");
        }

        // Mirror frame: response flag, echoed id, nonce stepped per word.
        let mangled = mangle(&BitVec::from_bytes(&nonce)).to_bytes().unwrap();
        let mut resp = vec![0xF1u8];
        resp.extend_from_slice(&uo_id.to_be_bytes());
        resp.extend_from_slice(&mangled);
        resp.extend_from_slice(&protected);
        let ct = AesCbcAlgo::with_padding(ZERO_IV).encrypt(&entry.enc, &resp).unwrap();
        let tag = CbcMac::compute(&entry.mac, &ct).unwrap();

        let mut out = vec![0x00, 0x00];
        out.extend_from_slice(&ct);
        out.extend_from_slice(&tag);
        let mut hex_out = hex::encode(out);
        if state.tamper_next {
            state.tamper_next = false;
            let last = hex_out.pop().unwrap();
            hex_out.push(if last == '0' { '1' } else { '0' });
        }

        serde_json::json!({
            "status": "9000",
            "statusdetail": "(OK)SW_STAT_OK",
            "function": "ProcessData",
            "result": format!("{}_{}_", hex_out, req_type),
            "version": "1.0",
        })
    }

    fn get_template(&self, state: &State) -> serde_json::Value {
        // 4-byte prefix || 32-byte comm-enc slot || 32-byte comm-mac slot
        // || 12-byte tail; flag byte at bit 8 wants comm keys generated.
        let mut blob = vec![0u8; 4];
        blob[1] = FLAG_GENERATE_COMM_KEYS | 0x01;
        blob.extend_from_slice(&[0u8; 64]);
        blob.extend_from_slice(&[0x5A; 12]);

        let key_tlv = import_key_tlv(&state.rsa);

        serde_json::json!({
            "status": "9000",
            "statusdetail": "(OK)SW_STAT_OK",
            "function": "GetUserObjectTemplate",
            "result": {
                "template": hex::encode(&blob),
                "encryptionoffset": 32,
                "flagoffset": 0,
                "keyoffsets": [
                    {"type": "comenc", "offset": 32, "length": 256},
                    {"type": "commac", "offset": 288, "length": 256},
                ],
                "importkeys": [
                    {"id": 9, "type": "rsa2048", "publickey": hex::encode(&key_tlv)}
                ],
                "objectid": format!("{:08x}", TEMPLATE_OBJECT_ID),
                "authorization": "auth-token",
            },
            "version": "1.0",
        })
    }

    fn get_import_keys(&self, state: &State) -> serde_json::Value {
        // Spaced TLV hex, the way the service formats published keys.
        let flat = hex::encode(import_key_tlv(&state.rsa));
        let spaced = flat
            .as_bytes()
            .chunks(8)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(" ");
        serde_json::json!({
            "status": "9000",
            "statusdetail": "(OK)SW_STAT_OK",
            "function": "GetImportPublicKey",
            "result": [
                {"id": 9, "type": "rsa", "certificate": null, "key": spaced}
            ],
            "version": "1.0",
        })
    }

    fn create_object(&self, state: &mut State, body: &serde_json::Value) -> serde_json::Value {
        assert_eq!(body["importkey"].as_i64(), Some(9));
        assert_eq!(body["authorization"].as_str(), Some("auth-token"));
        let blob = hex::decode(body["object"].as_str().unwrap()).unwrap();

        // [A1 || wrapped] [A2 || image]
        assert_eq!(blob[0], TAG_WRAPPED_KEYS);
        let wrapped_len = u16::from_be_bytes([blob[1], blob[2]]) as usize;
        let wrapped = &blob[3..3 + wrapped_len];
        assert_eq!(blob[3 + wrapped_len], TAG_TEMPLATE_IMAGE);
        let image = &blob[3 + wrapped_len + 3..];

        let mut unwrapped = vec![0u8; wrapped_len];
        let len = state
            .rsa
            .private_decrypt(wrapped, &mut unwrapped, openssl::rsa::Padding::PKCS1)
            .unwrap();
        unwrapped.truncate(len);
        assert_eq!(&unwrapped[..4], &TEMPLATE_OBJECT_ID.to_be_bytes());
        let tek: [u8; 32] = unwrapped[4..36].try_into().unwrap();
        let tmk: [u8; 32] = unwrapped[36..68].try_into().unwrap();

        let (inner, mac) = image.split_at(image.len() - 16);
        assert!(CbcMac::verify(&tmk, inner, mac).unwrap());
        let mut inner = inner.to_vec();
        pkcs7::remove(&mut inner, 16).unwrap();

        // Comm keys must be requested client-side now.
        assert_eq!(inner[1] & FLAG_GENERATE_COMM_KEYS, 0);
        let suffix = AesCbcAlgo::with_padding(ZERO_IV).decrypt(&tek, &inner[4..]).unwrap();
        let enc: [u8; 32] = suffix[..32].try_into().unwrap();
        let mac_key: [u8; 32] = suffix[32..64].try_into().unwrap();

        let uo_id = state.next_uo_id;
        state.next_uo_id += 1;
        state.uos.insert(uo_id, UoEntry { enc, mac: mac_key });
        state.created.push(uo_id);

        serde_json::json!({
            "status": "9000",
            "statusdetail": "(OK)SW_STAT_OK",
            "function": "CreateUserObject",
            "result": {
                "handle": format!("{}00{:08x}00{:08x}", API_KEY, uo_id, 1u32 << 20),
            },
            "version": "1.0",
        })
    }
}

impl HttpTransport for LoopbackHsm {
    fn get(&self, url: &str, _timeout: Duration) -> Result<TransportReply, TransportError> {
        self.dispatch(url, None)
    }

    fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        _timeout: Duration,
    ) -> Result<TransportReply, TransportError> {
        self.dispatch(url, Some(body))
    }
}

/// Server-side HOTP verification over a plaintext context blob.
///
/// The test context travels unencrypted (the real HSM would decrypt it);
/// the response TLV is returned either way so the failure counters
/// round-trip.
fn verify_hotp_blob(data: &[u8]) -> Vec<u8> {
    let (tag, ctx_blob, pos) = read_tlv(data, 0).unwrap();
    assert_eq!(tag, TAG_USER_CTX);
    let (tag, body, end) = read_tlv(data, pos).unwrap();
    assert_eq!(tag, TAG_HOTP_VERIFY);
    assert_eq!(end, data.len());

    let mut ctx = AuthContext::decode(ctx_blob).unwrap();
    let user_id: [u8; 8] = body[..8].try_into().unwrap();
    assert_eq!(user_id, ctx.user_id);
    let code: u32 = std::str::from_utf8(&body[8..]).unwrap().parse().unwrap();

    let mut status = SW_HOTP_WRONG;
    for method in &mut ctx.methods {
        if let AuthMethod::Hotp {
            counter,
            current_fails,
            max_fails,
            digits,
            secret,
        } = method
        {
            if *current_fails >= *max_fails {
                status = SW_HOTP_TOO_MANY;
                break;
            }
            let expected = hotp(secret, *counter, *digits as u32).unwrap();
            if expected == code {
                *counter += 1;
                *current_fails = 0;
                status = SW_OK;
            } else {
                *current_fails += 1;
                ctx.total_fails = ctx.total_fails.saturating_add(1);
                status = SW_HOTP_WRONG;
            }
            break;
        }
    }

    let fresh = ctx.encode().unwrap();
    let mut inner = user_id.to_vec();
    inner.extend_from_slice(&status.to_be_bytes());
    let mut out = tlv(TAG_USER_CTX, &fresh);
    out.extend_from_slice(&tlv(TAG_HOTP_VERIFY, &inner));
    out
}

fn import_key_tlv(rsa: &openssl::rsa::Rsa<openssl::pkey::Private>) -> Vec<u8> {
    let e = rsa.e().to_vec();
    let n = rsa.n().to_vec();
    let mut key_tlv = vec![0x81];
    key_tlv.extend_from_slice(&(e.len() as u16).to_be_bytes());
    key_tlv.extend_from_slice(&e);
    key_tlv.push(0x82);
    key_tlv.extend_from_slice(&(n.len() as u16).to_be_bytes());
    key_tlv.extend_from_slice(&n);
    key_tlv
}

fn error_envelope(status: u16, detail: &str) -> serde_json::Value {
    serde_json::json!({
        "status": format!("{:04x}", status),
        "statusdetail": detail,
        "function": "ProcessData",
        "version": "1.0",
    })
}

fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(tag);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn read_tlv(data: &[u8], pos: usize) -> Option<(u8, &[u8], usize)> {
    if pos + 3 > data.len() {
        return None;
    }
    let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
    let start = pos + 3;
    if start + len > data.len() {
        return None;
    }
    Some((data[pos], &data[start..start + len], start + len))
}

/// Initializes test logging once.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

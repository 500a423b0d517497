// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod common;

use common::*;
use uohsm_api::auth::AuthContext;
use uohsm_api::auth::AuthMethod;
use uohsm_api::auth::AuthState;
use uohsm_crypto::hotp;

const SECRET: &[u8; 16] = b"1234567890123456";
const USER_ID: [u8; 8] = *b"user0001";

fn context(counter: u64) -> AuthContext {
    AuthContext {
        version: 1,
        user_id: USER_ID,
        flags: 0,
        total_fails: 0,
        max_fails: 5,
        methods: vec![AuthMethod::Hotp {
            counter,
            current_fails: 0,
            max_fails: 3,
            digits: 6,
            secret: SECRET.to_vec(),
        }],
    }
}

fn hotp_counter(ctx: &AuthContext) -> (u64, u8) {
    match &ctx.methods[0] {
        AuthMethod::Hotp {
            counter,
            current_fails,
            ..
        } => (*counter, *current_fails),
        other => panic!("unexpected method {:?}", other),
    }
}

#[test]
fn test_hotp_auth_success_advances_counter() {
    init_tracing();
    let hsm = LoopbackHsm::new();
    let uo = hsm.register_uo(0xA001, [0x01; 32], [0x02; 32]);
    let client = hsm.client();

    let ctx = context(1);
    let mut session = client.auth_session(&uo, USER_ID, ctx.encode().unwrap());
    assert_eq!(session.state(), AuthState::Idle);

    let code = hotp(SECRET, 1, 6).unwrap();
    let outcome = session.verify_hotp(code, 6).unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.status, 0x9000);
    assert_eq!(session.state(), AuthState::AuthOk);

    // The fresh context advanced the counter.
    let fresh = AuthContext::decode(session.user_ctx()).unwrap();
    assert_eq!(hotp_counter(&fresh), (2, 0));

    // The next code verifies against the fresh context.
    let code = hotp(SECRET, 2, 6).unwrap();
    assert!(session.verify_hotp(code, 6).unwrap().ok);
}

#[test]
fn test_hotp_auth_wrong_code_updates_context() {
    init_tracing();
    let hsm = LoopbackHsm::new();
    let uo = hsm.register_uo(0xA002, [0x03; 32], [0x04; 32]);
    let client = hsm.client();

    let ctx = context(7);
    let mut session = client.auth_session(&uo, USER_ID, ctx.encode().unwrap());

    // An off-by-one code must be rejected.
    let wrong = (hotp(SECRET, 7, 6).unwrap() + 1) % 1_000_000;
    let outcome = session.verify_hotp(wrong, 6).unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.status & 0xF000, 0xA000);
    assert_eq!(session.state(), AuthState::AuthFailed);

    // The failure counter moved; the caller must persist this context.
    let fresh = AuthContext::decode(session.user_ctx()).unwrap();
    assert_eq!(hotp_counter(&fresh), (7, 1));
    assert_eq!(fresh.total_fails, 1);

    // The right code still works afterwards.
    let code = hotp(SECRET, 7, 6).unwrap();
    assert!(session.verify_hotp(code, 6).unwrap().ok);
    let fresh = AuthContext::decode(session.user_ctx()).unwrap();
    assert_eq!(hotp_counter(&fresh), (8, 0));
}

#[test]
fn test_hotp_auth_failure_budget() {
    init_tracing();
    let hsm = LoopbackHsm::new();
    let uo = hsm.register_uo(0xA003, [0x05; 32], [0x06; 32]);
    let client = hsm.client();

    let mut session = client.auth_session(&uo, USER_ID, context(3).encode().unwrap());

    let wrong = (hotp(SECRET, 3, 6).unwrap() + 1) % 1_000_000;
    for _ in 0..3 {
        let outcome = session.verify_hotp(wrong, 6).unwrap();
        assert_eq!(outcome.status, 0xA0B0);
    }
    // The method budget (3) is spent; further attempts report lock-out.
    let outcome = session.verify_hotp(wrong, 6).unwrap();
    assert_eq!(outcome.status, 0xA0B1);
}

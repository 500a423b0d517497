// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Freshness nonces and the response-nonce transform.
//!
//! Every request carries 8 random bytes; the service echoes them back with
//! `0x01010101` added to each 32-bit word (equivalently, every byte
//! incremented by one, wrapping). The parser undoes exactly that transform.
//! The per-word helpers operate on the bit container so partial tails are
//! handled for any bit length, not just the 8-byte wire case.

use uohsm_crypto::BitVec;
use uohsm_crypto::Rng;

use crate::error::HsmResult;

/// Freshness-nonce length in bytes.
pub const NONCE_LEN: usize = 8;

/// Per-word constant the service adds to the request nonce.
const NONCE_STEP: u32 = 0x01010101;

/// Generates a fresh 8-byte nonce from the CSPRNG.
pub fn gen_nonce() -> HsmResult<[u8; NONCE_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    Rng::rand_bytes(&mut nonce)?;
    Ok(nonce)
}

/// Undoes the server's response-nonce transform.
pub fn demangle(mangled: &BitVec) -> BitVec {
    mangled.wrapping_sub_per_word(NONCE_STEP)
}

/// Applies the server-side transform; the loopback test harness uses this
/// to fabricate responses.
pub fn mangle(nonce: &BitVec) -> BitVec {
    nonce.wrapping_add_per_word(NONCE_STEP)
}

/// Demangles the fixed-width wire nonce.
pub fn demangle_bytes(mangled: &[u8; NONCE_LEN]) -> [u8; NONCE_LEN] {
    let out = demangle(&BitVec::from_bytes(mangled));
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&out.to_bytes().expect("byte aligned"));
    nonce
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CSPRNG facade.
//!
//! All randomness in the client (freshness nonces, transport keys, PKCS#1
//! type-2 filler) flows through [`Rng`], which is backed by OpenSSL's
//! system-seeded generator. There is deliberately no non-CSPRNG path.

use crate::CryptoError;

/// Cryptographically secure random number generator.
#[derive(Debug, Clone)]
pub struct Rng;

impl Rng {
    /// Fills `buf` with random bytes.
    pub fn rand_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
        openssl::rand::rand_bytes(buf).map_err(|_| CryptoError::RngError)
    }

    /// Returns a random 32-bit word.
    pub fn rand_u32() -> Result<u32, CryptoError> {
        let mut buf = [0u8; 4];
        Self::rand_bytes(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Returns a fresh 256-bit key.
    pub fn rand_key256() -> Result<[u8; 32], CryptoError> {
        let mut key = [0u8; 32];
        Self::rand_bytes(&mut key)?;
        Ok(key)
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AES-CBC and AES-CBC-MAC, the symmetric envelope of the wire format.
//!
//! The protocol encrypts every frame with AES-256-CBC under an all-zero IV
//! (the leading freshness nonce doubles as the IV) and authenticates the
//! ciphertext with a CBC-MAC under a separate key. Both operations are
//! backed by OpenSSL's `Crypter`.
//!
//! CBC-MAC is only safe over fixed-structure, length-delimited inputs; the
//! implementation therefore rejects any MAC input that is empty or not a
//! multiple of the block size, and callers keep the framing length checks in
//! front of it.

use openssl::symm::Cipher;
use openssl::symm::Crypter;
use openssl::symm::Mode;

use crate::pkcs7;
use crate::CryptoError;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// All-zero IV used by the wire format.
pub const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0u8; AES_BLOCK_SIZE];

/// AES-CBC operation configured with an IV and a padding mode.
pub struct AesCbcAlgo {
    /// Whether to apply PKCS#7 padding around the cipher.
    pad: bool,

    /// Initialization vector (16 bytes).
    iv: [u8; AES_BLOCK_SIZE],
}

impl AesCbcAlgo {
    /// CBC with automatic PKCS#7 padding.
    pub fn with_padding(iv: [u8; AES_BLOCK_SIZE]) -> Self {
        Self { pad: true, iv }
    }

    /// CBC over caller-aligned input; no padding is added or checked.
    pub fn with_no_padding(iv: [u8; AES_BLOCK_SIZE]) -> Self {
        Self { pad: false, iv }
    }

    /// Encrypts `input` under `key`.
    ///
    /// In unpadded mode the input must be a positive multiple of the block
    /// size. Padding, when enabled, is applied here rather than inside
    /// OpenSSL so the same PKCS#7 code path serves both the cipher and the
    /// strict unpad validation.
    pub fn encrypt(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = cipher_for(key.len())?;

        let buf;
        let input = if self.pad {
            buf = pkcs7::pad(input, AES_BLOCK_SIZE);
            &buf[..]
        } else {
            if input.is_empty() || input.len() % AES_BLOCK_SIZE != 0 {
                Err(CryptoError::AesInvalidInputSize)?;
            }
            input
        };

        let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, Some(&self.iv))
            .map_err(|_| CryptoError::AesEncryptError)?;
        crypter.pad(false);

        let mut out = vec![0u8; input.len() + AES_BLOCK_SIZE];
        let mut count = crypter
            .update(input, &mut out)
            .map_err(|_| CryptoError::AesEncryptError)?;
        count += crypter
            .finalize(&mut out[count..])
            .map_err(|_| CryptoError::AesEncryptError)?;
        out.truncate(count);
        Ok(out)
    }

    /// Decrypts `input` under `key`, validating PKCS#7 in padded mode.
    pub fn decrypt(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = cipher_for(key.len())?;
        if input.is_empty() || input.len() % AES_BLOCK_SIZE != 0 {
            Err(CryptoError::AesInvalidInputSize)?;
        }

        let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(&self.iv))
            .map_err(|_| CryptoError::AesDecryptError)?;
        crypter.pad(false);

        let mut out = vec![0u8; input.len() + AES_BLOCK_SIZE];
        let mut count = crypter
            .update(input, &mut out)
            .map_err(|_| CryptoError::AesDecryptError)?;
        count += crypter
            .finalize(&mut out[count..])
            .map_err(|_| CryptoError::AesDecryptError)?;
        out.truncate(count);

        if self.pad {
            pkcs7::remove(&mut out, AES_BLOCK_SIZE)?;
        }
        Ok(out)
    }
}

/// AES-CBC-MAC: last ciphertext block of a zero-IV CBC pass.
pub struct CbcMac;

impl CbcMac {
    /// Computes the 16-byte tag over `data` under `key`.
    ///
    /// `data` must already be aligned (the wire format MACs ciphertext,
    /// which is always block-aligned); empty input is rejected.
    pub fn compute(key: &[u8], data: &[u8]) -> Result<[u8; AES_BLOCK_SIZE], CryptoError> {
        if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
            Err(CryptoError::MacInvalidInputSize)?;
        }

        let ct = AesCbcAlgo::with_no_padding(ZERO_IV).encrypt(key, data)?;
        let mut tag = [0u8; AES_BLOCK_SIZE];
        tag.copy_from_slice(&ct[ct.len() - AES_BLOCK_SIZE..]);
        Ok(tag)
    }

    /// Computes the tag and compares against `tag` in constant time.
    pub fn verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool, CryptoError> {
        if tag.len() != AES_BLOCK_SIZE {
            return Ok(false);
        }
        let computed = Self::compute(key, data)?;
        Ok(openssl::memcmp::eq(&computed, tag))
    }
}

fn cipher_for(key_size: usize) -> Result<Cipher, CryptoError> {
    match key_size {
        16 => Ok(Cipher::aes_128_cbc()),
        24 => Ok(Cipher::aes_192_cbc()),
        32 => Ok(Cipher::aes_256_cbc()),
        _ => Err(CryptoError::AesInvalidKeySize),
    }
}

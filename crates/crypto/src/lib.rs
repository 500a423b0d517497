// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cryptographic primitives for the user-object HSM client.
//!
//! This crate provides the low-level building blocks the wire codec and the
//! provisioning pipeline are assembled from:
//!
//! - **Bit container**: fixed-width 32-bit word sequences with exact bit-length
//!   tracking, for sub-byte splicing and extraction
//! - **Padding**: PKCS#7 and PKCS#1 v1.5 (block types 0/1/2) with strict
//!   validation
//! - **AES-CBC / CBC-MAC**: the symmetric envelope used by the wire format
//! - **Raw RSA**: public-key operation over a TLV-encoded import key
//! - **HOTP**: RFC 4226 one-time-password generation
//! - **RNG**: CSPRNG facade over the platform backend
//!
//! All implementations are backed by OpenSSL.

mod bits;
mod cbc;
mod hotp;
mod pad;
mod rand;
mod rsa;

pub use bits::*;
pub use cbc::*;
pub use hotp::*;
pub use pad::*;
pub use rand::*;
pub use rsa::*;
use thiserror::Error;

/// Error type for all cryptographic operations in this crate.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    // AES-related errors
    /// AES key size is invalid for the specified algorithm.
    #[error("AES invalid key size")]
    AesInvalidKeySize,
    /// AES input size is invalid (not a multiple of the block size).
    #[error("AES invalid input size")]
    AesInvalidInputSize,
    /// AES encryption operation failed.
    #[error("AES encryption failed")]
    AesEncryptError,
    /// AES decryption operation failed.
    #[error("AES decryption failed")]
    AesDecryptError,
    /// AES padding is invalid or verification failed.
    #[error("AES invalid padding")]
    AesInvalidPadding,

    // CBC-MAC errors
    /// CBC-MAC input is empty or not a multiple of the block size.
    #[error("CBC-MAC invalid input size")]
    MacInvalidInputSize,

    // Random number generation errors
    /// Random number generation operation failed.
    #[error("Random number generation failed")]
    RngError,

    // HMAC-related errors
    /// HMAC key import failed.
    #[error("HMAC key import failed")]
    HmacKeyImportError,
    /// HMAC signing operation failed.
    #[error("HMAC sign failed")]
    HmacSignError,
    /// HOTP digit count is outside the supported range.
    #[error("HOTP invalid digit count")]
    HotpInvalidDigits,

    // RSA-related errors
    /// General RSA operation failure.
    #[error("RSA operation failed")]
    RsaError,
    /// Invalid public key blob (TLV) format.
    #[error("RSA invalid public key blob")]
    RsaInvalidPublicKeyBlob,
    /// RSA message is too long for the given key size and padding scheme.
    #[error("RSA message too long")]
    RsaMessageTooLong,
    /// RSA input size does not match the modulus size.
    #[error("RSA invalid input size")]
    RsaInvalidInputSize,
    /// RSA PKCS#1 padding is invalid or verification failed.
    #[error("RSA invalid padding")]
    RsaInvalidPadding,

    // Bit container errors
    /// Requested bit range lies outside the container.
    #[error("bit range out of bounds")]
    BitsOutOfRange,
    /// Requested extraction width is not representable.
    #[error("bit width invalid for operation")]
    BitsInvalidWidth,
    /// Operand bit lengths do not match.
    #[error("bit length mismatch")]
    BitsLengthMismatch,
    /// Container is not byte-aligned where bytes were requested.
    #[error("bit length not byte aligned")]
    BitsNotByteAligned,

    // Codec errors
    /// Input is not valid hex.
    #[error("invalid hex input")]
    HexInvalidInput,
    /// Input is not valid base32.
    #[error("invalid base32 input")]
    Base32InvalidInput,
}

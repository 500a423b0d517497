// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HOTP (RFC 4226) one-time-password generation.
//!
//! The HSM verifies HOTP codes server-side; the client-side generator exists
//! for seeding user objects and for driving the verification tests. Dynamic
//! truncation goes through the bit container: the 31-bit extraction is
//! exactly the case the generic extractor exists for.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

use crate::BitVec;
use crate::CryptoError;

/// Smallest supported code length.
pub const HOTP_MIN_DIGITS: u32 = 6;
/// Largest supported code length.
pub const HOTP_MAX_DIGITS: u32 = 8;

/// Computes the HOTP value for `secret` at `counter`.
///
/// Returns the truncated decimal code as an integer; use
/// [`format_code`] for the zero-padded string the wire protocol carries.
pub fn hotp(secret: &[u8], counter: u64, digits: u32) -> Result<u32, CryptoError> {
    if !(HOTP_MIN_DIGITS..=HOTP_MAX_DIGITS).contains(&digits) {
        Err(CryptoError::HotpInvalidDigits)?;
    }

    let key = PKey::hmac(secret).map_err(|_| CryptoError::HmacKeyImportError)?;
    let mut signer =
        Signer::new(MessageDigest::sha1(), &key).map_err(|_| CryptoError::HmacSignError)?;
    signer
        .update(&counter.to_be_bytes())
        .map_err(|_| CryptoError::HmacSignError)?;
    let mac = signer
        .sign_to_vec()
        .map_err(|_| CryptoError::HmacSignError)?;

    // Dynamic truncation: the low nibble of the last byte selects a byte
    // offset; the 31 bits after that offset's top bit form the code.
    let offset = (mac[mac.len() - 1] & 0x0F) as usize;
    let bits = BitVec::from_bytes(&mac);
    let code = bits.extract(offset * 8 + 1, 31)?;

    Ok(code % 10u32.pow(digits))
}

/// Formats a code the way it travels on the wire: zero-padded ASCII digits.
pub fn format_code(code: u32, digits: u32) -> String {
    format!("{:0width$}", code, width = digits as usize)
}

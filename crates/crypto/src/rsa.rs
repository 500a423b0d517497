// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Raw RSA public-key operation over a TLV-encoded import key.
//!
//! The HSM publishes its import keys as a TLV blob: tag `0x81` carries the
//! public exponent, tag `0x82` the modulus, both with 16-bit big-endian
//! lengths; unknown tags are skipped. Transport keys are wrapped by padding
//! with PKCS#1 v1.5 type 2 and applying the bare `m^e mod n` operation, so
//! the implementation works directly on `BigNum` rather than going through
//! an OpenSSL key object.

use openssl::bn::BigNum;
use openssl::bn::BigNumContext;

use crate::CryptoError;

const TAG_PUBLIC_EXPONENT: u8 = 0x81;
const TAG_MODULUS: u8 = 0x82;

/// RSA public key parsed from the import-key TLV format.
pub struct RsaPublicKey {
    n: BigNum,
    e: BigNum,
    modulus_len: usize,
}

impl RsaPublicKey {
    /// Parses a TLV-encoded public key.
    ///
    /// Records are `tag(1) || len(2, BE) || value`; `0x81` is the exponent
    /// and `0x82` the modulus. Records with other tags are skipped. Both
    /// mandatory records must be present exactly once.
    pub fn from_tlv(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut e: Option<BigNum> = None;
        let mut n: Option<BigNum> = None;

        let mut pos = 0;
        while pos < bytes.len() {
            if pos + 3 > bytes.len() {
                Err(CryptoError::RsaInvalidPublicKeyBlob)?;
            }
            let tag = bytes[pos];
            let len = u16::from_be_bytes([bytes[pos + 1], bytes[pos + 2]]) as usize;
            pos += 3;
            if pos + len > bytes.len() {
                Err(CryptoError::RsaInvalidPublicKeyBlob)?;
            }
            let value = &bytes[pos..pos + len];
            pos += len;

            match tag {
                TAG_PUBLIC_EXPONENT => {
                    if e.is_some() {
                        Err(CryptoError::RsaInvalidPublicKeyBlob)?;
                    }
                    e = Some(
                        BigNum::from_slice(value)
                            .map_err(|_| CryptoError::RsaInvalidPublicKeyBlob)?,
                    );
                }
                TAG_MODULUS => {
                    if n.is_some() {
                        Err(CryptoError::RsaInvalidPublicKeyBlob)?;
                    }
                    n = Some(
                        BigNum::from_slice(value)
                            .map_err(|_| CryptoError::RsaInvalidPublicKeyBlob)?,
                    );
                }
                _ => {}
            }
        }

        let n = n.ok_or(CryptoError::RsaInvalidPublicKeyBlob)?;
        let e = e.ok_or(CryptoError::RsaInvalidPublicKeyBlob)?;
        let modulus_len = n.num_bytes() as usize;
        if modulus_len == 0 {
            Err(CryptoError::RsaInvalidPublicKeyBlob)?;
        }

        Ok(Self { n, e, modulus_len })
    }

    /// Builds a key from raw big-endian modulus and exponent bytes.
    pub fn from_components(modulus: &[u8], exponent: &[u8]) -> Result<Self, CryptoError> {
        let n = BigNum::from_slice(modulus).map_err(|_| CryptoError::RsaInvalidPublicKeyBlob)?;
        let e = BigNum::from_slice(exponent).map_err(|_| CryptoError::RsaInvalidPublicKeyBlob)?;
        let modulus_len = n.num_bytes() as usize;
        if modulus_len == 0 {
            Err(CryptoError::RsaInvalidPublicKeyBlob)?;
        }
        Ok(Self { n, e, modulus_len })
    }

    /// Modulus length in bytes (128 for RSA-1024, 256 for RSA-2048).
    pub fn modulus_len(&self) -> usize {
        self.modulus_len
    }

    /// Raw `input^e mod n`.
    ///
    /// `input` must be exactly one modulus in length (the caller pads with
    /// PKCS#1 first); the result is left-padded back to the modulus length.
    pub fn public_op(&self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if input.len() != self.modulus_len {
            Err(CryptoError::RsaInvalidInputSize)?;
        }

        let m = BigNum::from_slice(input).map_err(|_| CryptoError::RsaError)?;
        if m >= self.n {
            Err(CryptoError::RsaInvalidInputSize)?;
        }

        let mut ctx = BigNumContext::new().map_err(|_| CryptoError::RsaError)?;
        let mut out = BigNum::new().map_err(|_| CryptoError::RsaError)?;
        out.mod_exp(&m, &self.e, &self.n, &mut ctx)
            .map_err(|_| CryptoError::RsaError)?;

        let bytes = out.to_vec();
        let mut padded = vec![0u8; self.modulus_len - bytes.len()];
        padded.extend_from_slice(&bytes);
        Ok(padded)
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Block-cipher padding schemes.
//!
//! Two schemes are used by the wire format: PKCS#7 for the AES-CBC envelope
//! and PKCS#1 v1.5 (block types 0, 1 and 2) for wrapping transport keys under
//! the import RSA key. Both unpad paths validate strictly; the PKCS#7 tail
//! check is constant time in the padding bytes.

use crate::CryptoError;
use crate::Rng;

/// PKCS#7 padding utilities - works with any block cipher.
pub mod pkcs7 {
    use super::*;

    /// AES block size; the wire format uses 16-byte blocks throughout.
    pub const BLOCK_SIZE: usize = 16;

    /// Apply PKCS#7 padding to input data.
    ///
    /// Appends `k` bytes of value `k` where `k = block_size - (len % block_size)`;
    /// a full block is appended when the input is already aligned.
    pub fn apply(input: &[u8], output: &mut Vec<u8>, block_size: usize) {
        output.extend_from_slice(input);
        let padding_len = block_size - (input.len() % block_size);
        for _ in 0..padding_len {
            output.push(padding_len as u8);
        }
    }

    /// Convenience wrapper returning a freshly padded copy.
    pub fn pad(input: &[u8], block_size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() + block_size);
        apply(input, &mut out, block_size);
        out
    }

    /// Remove PKCS#7 padding from decrypted data.
    ///
    /// The tail comparison accumulates differences rather than short-circuiting,
    /// so the time taken does not depend on which padding byte is wrong.
    pub fn remove(data: &mut Vec<u8>, block_size: usize) -> Result<(), CryptoError> {
        if data.is_empty() || data.len() % block_size != 0 {
            Err(CryptoError::AesInvalidPadding)?;
        }

        let padding_len = *data.last().expect("non-empty") as usize;
        if padding_len == 0 || padding_len > block_size || padding_len > data.len() {
            Err(CryptoError::AesInvalidPadding)?;
        }

        let start_idx = data.len() - padding_len;
        let mut acc = 0u8;
        for &byte in &data[start_idx..] {
            acc |= byte ^ padding_len as u8;
        }
        if acc != 0 {
            Err(CryptoError::AesInvalidPadding)?;
        }

        data.truncate(start_idx);
        Ok(())
    }
}

/// PKCS#1 v1.5 block types.
///
/// The filler octets between the type byte and the `0x00` terminator depend
/// on the block type: zeros for type 0, `0xFF` for type 1, uniform non-zero
/// random bytes for type 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Pkcs1BlockType {
    /// Private-key operation, zero filler.
    Bt0 = 0,
    /// Private-key operation, `0xFF` filler.
    Bt1 = 1,
    /// Public-key encryption, random non-zero filler.
    Bt2 = 2,
}

impl TryFrom<u8> for Pkcs1BlockType {
    type Error = CryptoError;

    fn try_from(v: u8) -> Result<Self, CryptoError> {
        match v {
            0 => Ok(Pkcs1BlockType::Bt0),
            1 => Ok(Pkcs1BlockType::Bt1),
            2 => Ok(Pkcs1BlockType::Bt2),
            _ => Err(CryptoError::RsaInvalidPadding),
        }
    }
}

/// PKCS#1 v1.5 padding, `EM = 0x00 || BT || PS || 0x00 || D`.
pub mod pkcs1 {
    use super::*;

    /// Minimum padding-string length mandated by the scheme.
    const MIN_PS_LEN: usize = 8;

    /// Pads `data` into a block of `block_len` bytes with the given block type.
    pub fn pad(
        data: &[u8],
        block_len: usize,
        bt: Pkcs1BlockType,
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() + MIN_PS_LEN + 3 > block_len {
            Err(CryptoError::RsaMessageTooLong)?;
        }

        let ps_len = block_len - 3 - data.len();
        let mut out = Vec::with_capacity(block_len);
        out.push(0x00);
        out.push(bt as u8);

        match bt {
            Pkcs1BlockType::Bt0 => out.resize(2 + ps_len, 0x00),
            Pkcs1BlockType::Bt1 => out.resize(2 + ps_len, 0xFF),
            Pkcs1BlockType::Bt2 => {
                for _ in 0..ps_len {
                    out.push(nonzero_octet()?);
                }
            }
        }

        out.push(0x00);
        out.extend_from_slice(data);
        Ok(out)
    }

    /// Strips PKCS#1 v1.5 padding, returning the block type and the payload.
    pub fn unpad(block: &[u8]) -> Result<(Pkcs1BlockType, Vec<u8>), CryptoError> {
        if block.len() < MIN_PS_LEN + 3 || block[0] != 0x00 {
            Err(CryptoError::RsaInvalidPadding)?;
        }
        let bt = Pkcs1BlockType::try_from(block[1])?;

        let body = &block[2..];
        let data_start = match bt {
            Pkcs1BlockType::Bt0 => {
                // PS is all zero; data begins at the first non-zero octet.
                match body.iter().position(|&b| b != 0x00) {
                    Some(i) if i >= MIN_PS_LEN => i,
                    _ => Err(CryptoError::RsaInvalidPadding)?,
                }
            }
            Pkcs1BlockType::Bt1 => {
                // Every padding octet must be 0xFF up to the terminator.
                let mut i = 0;
                while i < body.len() && body[i] == 0xFF {
                    i += 1;
                }
                if i < MIN_PS_LEN || i >= body.len() || body[i] != 0x00 {
                    Err(CryptoError::RsaInvalidPadding)?;
                }
                i + 1
            }
            Pkcs1BlockType::Bt2 => {
                let mut i = 0;
                while i < body.len() && body[i] != 0x00 {
                    i += 1;
                }
                if i < MIN_PS_LEN || i >= body.len() {
                    Err(CryptoError::RsaInvalidPadding)?;
                }
                i + 1
            }
        };

        Ok((bt, body[data_start..].to_vec()))
    }

    fn nonzero_octet() -> Result<u8, CryptoError> {
        let mut octet = 0u8;
        let mut attempts = 0;
        while octet == 0 && attempts < 10 {
            Rng::rand_bytes(std::slice::from_mut(&mut octet))?;
            attempts += 1;
        }
        if octet == 0 {
            Err(CryptoError::RngError)?;
        }
        Ok(octet)
    }
}

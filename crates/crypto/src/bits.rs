// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bit-exact container over 32-bit big-endian words.
//!
//! Wire frames in this protocol are not always byte-aligned: HOTP truncation
//! extracts a 31-bit value, template key slots are addressed in bits, and the
//! response-nonce transform operates per 32-bit word with a partial tail. The
//! [`BitVec`] type therefore tracks an exact bit length alongside its word
//! storage instead of rounding up to bytes.
//!
//! # Representation
//!
//! Bits are stored in 32-bit words, big-endian within each word: bit 0 of the
//! container is the most significant bit of word 0. The unused low bits of a
//! partial final word are always zero; every operation maintains that
//! invariant.

use crate::CryptoError;

/// Bit sequence backed by 32-bit big-endian words with an exact bit length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u32>,
    bit_len: usize,
}

impl BitVec {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a container from raw words and an exact bit length.
    ///
    /// `bit_len` must satisfy `32 * (words.len() - 1) < bit_len <= 32 * words.len()`
    /// (or both zero). Unused low bits of the final word are cleared.
    pub fn from_words(words: &[u32], bit_len: usize) -> Result<Self, CryptoError> {
        if bit_len > words.len() * 32 || (bit_len + 31) / 32 != words.len() {
            return Err(CryptoError::BitsOutOfRange);
        }
        let mut words = words.to_vec();
        if let Some(last) = words.last_mut() {
            *last &= tail_mask(bit_len);
        }
        Ok(Self { words, bit_len })
    }

    /// Builds a container from bytes; the bit length is `8 * bytes.len()`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = Vec::with_capacity((bytes.len() + 3) / 4);
        for chunk in bytes.chunks(4) {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            words.push(u32::from_be_bytes(w));
        }
        Self {
            words,
            bit_len: bytes.len() * 8,
        }
    }

    /// Decodes a hex string (even number of digits) into a container.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::HexInvalidInput)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Decodes an unpadded RFC 4648 base32 string into a container.
    pub fn from_base32(s: &str) -> Result<Self, CryptoError> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|_| CryptoError::Base32InvalidInput)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Builds a 64-bit container from an integer, big-endian.
    pub fn from_u64(v: u64) -> Self {
        Self {
            words: vec![(v >> 32) as u32, v as u32],
            bit_len: 64,
        }
    }

    /// Reads a 64-bit container back into an integer.
    pub fn to_u64(&self) -> Result<u64, CryptoError> {
        if self.bit_len != 64 {
            return Err(CryptoError::BitsInvalidWidth);
        }
        Ok(((self.words[0] as u64) << 32) | self.words[1] as u64)
    }

    /// Exact length in bits.
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Length in whole bytes; fails when the container is not byte-aligned.
    pub fn byte_len(&self) -> Result<usize, CryptoError> {
        if self.bit_len % 8 != 0 {
            return Err(CryptoError::BitsNotByteAligned);
        }
        Ok(self.bit_len / 8)
    }

    /// True when the container holds no bits.
    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    /// Backing words; the final word is left-aligned when partial.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Serializes a byte-aligned container to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let len = self.byte_len()?;
        let mut out = Vec::with_capacity(len);
        for w in &self.words {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out.truncate(len);
        Ok(out)
    }

    /// Lower-case hex encoding of a byte-aligned container.
    pub fn to_hex(&self) -> Result<String, CryptoError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// Unpadded RFC 4648 base32 encoding of a byte-aligned container.
    pub fn to_base32(&self) -> Result<String, CryptoError> {
        Ok(data_encoding::BASE32_NOPAD.encode(&self.to_bytes()?))
    }

    /// Extracts `width` bits starting at `lo` as a right-aligned integer.
    ///
    /// `width` must be less than 32; use [`BitVec::extract32`] for a full
    /// word. The split exists because the generic mask `(1 << width) - 1`
    /// is not representable at `width == 32`.
    pub fn extract(&self, lo: usize, width: usize) -> Result<u32, CryptoError> {
        if width >= 32 {
            return Err(CryptoError::BitsInvalidWidth);
        }
        if width == 0 {
            return Ok(0);
        }
        if lo + width > self.bit_len {
            return Err(CryptoError::BitsOutOfRange);
        }
        let v = self.window64(lo / 32);
        let shift = 64 - (lo % 32) - width;
        Ok(((v >> shift) as u32) & ((1u32 << width) - 1))
    }

    /// Extracts exactly 32 bits starting at `lo`.
    pub fn extract32(&self, lo: usize) -> Result<u32, CryptoError> {
        if lo + 32 > self.bit_len {
            return Err(CryptoError::BitsOutOfRange);
        }
        let v = self.window64(lo / 32);
        Ok((v >> (32 - (lo % 32))) as u32)
    }

    /// Returns the bits in `[lo, hi)` as a new container.
    pub fn bit_slice(&self, lo: usize, hi: usize) -> Result<BitVec, CryptoError> {
        if lo > hi || hi > self.bit_len {
            return Err(CryptoError::BitsOutOfRange);
        }
        let mut out = BitVec::new();
        let mut pos = lo;
        while pos + 32 <= hi {
            out.push_bits(self.extract32(pos)?, 32);
            pos += 32;
        }
        let rem = hi - pos;
        if rem > 0 {
            out.push_bits(self.extract(pos, rem)?, rem);
        }
        Ok(out)
    }

    /// Appends another container, preserving exact bit lengths.
    pub fn concat(&self, other: &BitVec) -> BitVec {
        let mut out = self.clone();
        let mut pos = 0;
        while pos + 32 <= other.bit_len {
            // In-range by construction.
            out.push_bits(other.extract32(pos).unwrap_or(0), 32);
            pos += 32;
        }
        let rem = other.bit_len - pos;
        if rem > 0 {
            out.push_bits(other.extract(pos, rem).unwrap_or(0), rem);
        }
        out
    }

    /// Replaces the bits in `[lo, lo + patch.bit_len())` with `patch`.
    pub fn splice(&self, lo: usize, patch: &BitVec) -> Result<BitVec, CryptoError> {
        let hi = lo + patch.bit_len();
        if hi > self.bit_len {
            return Err(CryptoError::BitsOutOfRange);
        }
        let head = self.bit_slice(0, lo)?;
        let tail = self.bit_slice(hi, self.bit_len)?;
        Ok(head.concat(patch).concat(&tail))
    }

    /// XOR of two equal-length containers.
    pub fn xor(&self, other: &BitVec) -> Result<BitVec, CryptoError> {
        if self.bit_len != other.bit_len {
            return Err(CryptoError::BitsLengthMismatch);
        }
        let words = self
            .words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| a ^ b)
            .collect::<Vec<_>>();
        Ok(BitVec {
            words,
            bit_len: self.bit_len,
        })
    }

    /// Subtracts `c` from every 32-bit word, wrapping.
    ///
    /// For a partial final word of `r` bits, only the high `r` bits of `c`
    /// participate and the result is masked back to `r` bits, so the tail
    /// never borrows from bits that do not exist.
    pub fn wrapping_sub_per_word(&self, c: u32) -> BitVec {
        self.per_word(c, |w, k| w.wrapping_sub(k))
    }

    /// Adds `c` to every 32-bit word, wrapping; inverse of
    /// [`BitVec::wrapping_sub_per_word`].
    pub fn wrapping_add_per_word(&self, c: u32) -> BitVec {
        self.per_word(c, |w, k| w.wrapping_add(k))
    }

    /// Constant-time equality, for MAC tags and other secret-dependent
    /// comparisons. Falls back to a plain length check first; lengths are
    /// public here.
    pub fn ct_eq(&self, other: &BitVec) -> bool {
        if self.bit_len != other.bit_len {
            return false;
        }
        if self.words.is_empty() {
            return true;
        }
        let a: Vec<u8> = self.words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let b: Vec<u8> = other.words.iter().flat_map(|w| w.to_be_bytes()).collect();
        openssl::memcmp::eq(&a, &b)
    }

    /// Appends `width` bits (right-aligned in `value`) to the container.
    pub fn push_bits(&mut self, value: u32, width: usize) {
        debug_assert!(width <= 32);
        if width == 0 {
            return;
        }
        let value = if width == 32 {
            value
        } else {
            value & ((1u32 << width) - 1)
        };
        let off = self.bit_len % 32;
        if off == 0 {
            self.words.push(value << (32 - width));
        } else {
            let avail = 32 - off;
            let last = self.words.last_mut().expect("partial word exists");
            if width <= avail {
                *last |= value << (avail - width);
            } else {
                *last |= value >> (width - avail);
                self.words.push(value << (32 - (width - avail)));
            }
        }
        self.bit_len += width;
    }

    /// 64-bit window starting at word `w`, zero-extended past the end.
    fn window64(&self, w: usize) -> u64 {
        let hi = *self.words.get(w).unwrap_or(&0) as u64;
        let lo = *self.words.get(w + 1).unwrap_or(&0) as u64;
        (hi << 32) | lo
    }

    fn per_word(&self, c: u32, op: impl Fn(u32, u32) -> u32) -> BitVec {
        let mut words = self.words.clone();
        let n = words.len();
        if n == 0 {
            return self.clone();
        }
        let r = self.bit_len % 32;
        let full = if r == 0 { n } else { n - 1 };
        for w in words[..full].iter_mut() {
            *w = op(*w, c);
        }
        if r != 0 {
            let mask = u32::MAX << (32 - r);
            words[n - 1] = op(words[n - 1], c & mask) & mask;
        }
        BitVec {
            words,
            bit_len: self.bit_len,
        }
    }
}

/// Mask selecting the live (high) bits of a final word of `bit_len` bits.
fn tail_mask(bit_len: usize) -> u32 {
    match bit_len % 32 {
        0 => u32::MAX,
        r => u32::MAX << (32 - r),
    }
}

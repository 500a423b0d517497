// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! User-object handle codec.
//!
//! A handle is the printable token `apiKey || "00" || uoId || "00" || uoType`
//! with both ids as 8 lower-case hex digits. The type segment is optional on
//! input and defaults to zero. The api key alphabet is alphanumeric plus
//! `_` and `-`; because `00` can legally appear inside an api key, parsing
//! prefers the longest tail (type present) and falls back to the short one,
//! which matches a non-greedy key match.

use std::fmt;

use crate::error::HsmError;
use crate::error::HsmResult;

/// Bit set in `uo_type` when the communication keys were client-provided.
pub const UOTYPE_CLIENT_COMM_KEYS: u32 = 1 << 20;
/// Bit set in `uo_type` when the application key was client-provided.
pub const UOTYPE_CLIENT_APP_KEYS: u32 = 1 << 21;

/// Parsed user-object handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UoHandle {
    /// Opaque api key the object lives under.
    pub api_key: String,
    /// 32-bit user-object id.
    pub uo_id: u32,
    /// 32-bit capability word; zero when the handle carried no type segment.
    pub uo_type: u32,
}

impl UoHandle {
    /// Creates a handle from its parts.
    pub fn new(api_key: impl Into<String>, uo_id: u32, uo_type: u32) -> Self {
        Self {
            api_key: api_key.into(),
            uo_id,
            uo_type,
        }
    }

    /// Parses a printable handle.
    pub fn parse(s: &str) -> HsmResult<Self> {
        // The id/type tail is fixed-width, so only two split points can
        // match: api key + 20 chars (type present) or api key + 10 chars.
        for tail_len in [20usize, 10] {
            if s.len() <= tail_len {
                continue;
            }
            let split = s.len() - tail_len;
            let (key, tail) = s.split_at(split);
            if !is_valid_api_key(key) {
                continue;
            }
            if let Some(handle) = parse_tail(key, tail) {
                return Ok(handle);
            }
        }
        Err(HsmError::InvalidArgument("malformed user-object handle"))
    }

    /// True when the object was created with client-provided comm keys.
    pub fn has_client_comm_keys(&self) -> bool {
        self.uo_type & UOTYPE_CLIENT_COMM_KEYS != 0
    }

    /// True when the object was created with a client-provided app key.
    pub fn has_client_app_keys(&self) -> bool {
        self.uo_type & UOTYPE_CLIENT_APP_KEYS != 0
    }
}

impl fmt::Display for UoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}00{:08x}00{:08x}",
            self.api_key, self.uo_id, self.uo_type
        )
    }
}

fn is_valid_api_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn parse_tail(key: &str, tail: &str) -> Option<UoHandle> {
    let rest = tail.strip_prefix("00")?;
    let uo_id = parse_hex32(&rest[..8])?;
    let rest = &rest[8..];
    let uo_type = if rest.is_empty() {
        0
    } else {
        parse_hex32(rest.strip_prefix("00")?)?
    };
    Some(UoHandle::new(key, uo_id, uo_type))
}

fn parse_hex32(s: &str) -> Option<u32> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

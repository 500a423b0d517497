// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Template filling.
//!
//! A template is a server-issued, partly-filled user-object image: an opaque
//! blob plus metadata describing where the client's keys belong
//! (`keyoffsets`, in bits), which byte carries the key-generation flags, and
//! where the to-be-encrypted suffix starts (`encryptionoffset`). The filler
//! splices the caller's keys into the blob, clears the generate-for-me
//! flags, encrypts the suffix under a fresh transport encryption key (TEK),
//! MACs the whole image under a fresh transport MAC key (TMK), and wraps
//! `objectid || TEK || TMK` under the service's RSA import key.
//!
//! The blob is manipulated through the bit container because key slots are
//! addressed in bits, not bytes.

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;
use zeroize::Zeroizing;

use uohsm_crypto::pkcs1;
use uohsm_crypto::pkcs7;
use uohsm_crypto::AesCbcAlgo;
use uohsm_crypto::BitVec;
use uohsm_crypto::CbcMac;
use uohsm_crypto::Pkcs1BlockType;
use uohsm_crypto::Rng;
use uohsm_crypto::RsaPublicKey;
use uohsm_crypto::ZERO_IV;

use crate::error::CorruptKind;
use crate::error::HsmError;
use crate::error::HsmResult;

/// Outer tag of the RSA-wrapped transport keys.
pub const TAG_WRAPPED_KEYS: u8 = 0xA1;
/// Outer tag of the encrypted template image.
pub const TAG_TEMPLATE_IMAGE: u8 = 0xA2;

/// Flag bit requesting HSM-side generation of the comm keys.
const FLAG_GENERATE_COMM_KEYS: u8 = 0x08;
/// Flag bit requesting HSM-side generation of the app key.
const FLAG_GENERATE_APP_KEY: u8 = 0x10;

/// Slot name of the communication encryption key.
pub const SLOT_COMM_ENC: &str = "comenc";
/// Slot name of the communication MAC key.
pub const SLOT_COMM_MAC: &str = "commac";
/// Slot name of the next communication encryption key.
pub const SLOT_COMM_NEXT_ENC: &str = "comnextenc";
/// Slot name of the next communication MAC key.
pub const SLOT_COMM_NEXT_MAC: &str = "comnextmac";
/// Slot name of the application key.
pub const SLOT_APP: &str = "app";
/// Slot name of the billing key.
pub const SLOT_BILLING: &str = "billing";

/// One key slot inside the template blob; offsets and lengths in bits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyOffset {
    /// Slot name, matched verbatim against the supplied keys.
    pub r#type: String,
    /// Bit offset of the slot.
    pub offset: usize,
    /// Bit length of the slot.
    pub length: usize,
    /// TLV type the service assigned to the slot, when any.
    #[serde(default)]
    pub tlvtype: Option<u32>,
}

/// One RSA import key published with the template.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImportKey {
    /// Server-side key id, echoed back on create.
    pub id: i64,
    /// Key kind: `rsa1024` or `rsa2048`.
    pub r#type: String,
    /// TLV-hex public key; spaces allowed.
    pub publickey: String,
}

impl ImportKey {
    /// Parses the TLV-hex public key, tolerating embedded spaces.
    pub fn parse(&self) -> HsmResult<RsaPublicKey> {
        let compact: String = self
            .publickey
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = hex::decode(compact).map_err(|_| HsmError::Corrupt(CorruptKind::Template))?;
        Ok(RsaPublicKey::from_tlv(&bytes)?)
    }
}

/// Template record returned by `GetUserObjectTemplate`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UoTemplate {
    /// The opaque template image, hex.
    pub template: String,
    /// Bit offset where the encrypted suffix starts.
    pub encryptionoffset: usize,
    /// Bit offset of the flag area; the flag byte sits 8 bits in.
    pub flagoffset: usize,
    /// Key slots the client may fill.
    #[serde(default)]
    pub keyoffsets: Vec<KeyOffset>,
    /// Import keys usable for wrapping the transport keys.
    #[serde(default)]
    pub importkeys: Vec<ImportKey>,
    /// Object id assigned by the service, hex.
    pub objectid: String,
    /// Authorization token echoed back on create.
    #[serde(default)]
    pub authorization: Option<String>,
}

impl UoTemplate {
    /// The import key the filler will use: RSA-2048 when offered, else
    /// RSA-1024.
    pub fn select_import_key(&self) -> HsmResult<&ImportKey> {
        self.importkeys
            .iter()
            .find(|k| k.r#type.eq_ignore_ascii_case("rsa2048"))
            .or_else(|| {
                self.importkeys
                    .iter()
                    .find(|k| k.r#type.eq_ignore_ascii_case("rsa1024"))
            })
            .ok_or(HsmError::InvalidArgument("template offers no usable import key"))
    }

    /// Decodes the 4-byte object id.
    pub fn object_id_bytes(&self) -> HsmResult<[u8; 4]> {
        let bytes = hex::decode(&self.objectid)
            .map_err(|_| HsmError::Corrupt(CorruptKind::Template))?;
        bytes
            .try_into()
            .map_err(|_| HsmError::Corrupt(CorruptKind::Template))
    }
}

/// Keys supplied by the caller, addressed by slot name.
#[derive(Clone, Default)]
pub struct TemplateKeys {
    keys: BTreeMap<String, Zeroizing<Vec<u8>>>,
}

impl TemplateKeys {
    /// Empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies a key for a named slot.
    pub fn insert(&mut self, slot: impl Into<String>, key: &[u8]) {
        self.keys.insert(slot.into(), Zeroizing::new(key.to_vec()));
    }

    /// Supplies the four communication keys.
    pub fn with_comm_keys(
        mut self,
        enc: &[u8; 32],
        mac: &[u8; 32],
        next_enc: &[u8; 32],
        next_mac: &[u8; 32],
    ) -> Self {
        self.insert(SLOT_COMM_ENC, enc);
        self.insert(SLOT_COMM_MAC, mac);
        self.insert(SLOT_COMM_NEXT_ENC, next_enc);
        self.insert(SLOT_COMM_NEXT_MAC, next_mac);
        self
    }

    /// Supplies the application key.
    pub fn with_app_key(mut self, key: &[u8]) -> Self {
        self.insert(SLOT_APP, key);
        self
    }

    /// Supplies the billing key.
    pub fn with_billing_key(mut self, key: &[u8]) -> Self {
        self.insert(SLOT_BILLING, key);
        self
    }

    fn get(&self, slot: &str) -> Option<&[u8]> {
        self.keys.get(slot).map(|k| k.as_slice())
    }

    /// True when an application key was supplied.
    pub fn has_app_key(&self) -> bool {
        self.keys.contains_key(SLOT_APP)
    }
}

/// Output of the filler, ready for `CreateUserObject`.
pub struct FilledTemplate {
    /// `[0xA1 || wrapped keys] || [0xA2 || encrypted image]`.
    pub blob: Vec<u8>,
    /// Which import key wrapped the transport keys.
    pub import_key_id: i64,
}

/// Fills a template with the caller's keys and seals it for upload.
pub fn fill_template(tpl: &UoTemplate, keys: &TemplateKeys) -> HsmResult<FilledTemplate> {
    let mut blob = BitVec::from_hex(&tpl.template)
        .map_err(|_| HsmError::Corrupt(CorruptKind::Template))?;

    // Splice supplied keys into their slots; a supplied key must fill its
    // slot exactly.
    for slot in &tpl.keyoffsets {
        let key = match keys.get(&slot.r#type) {
            Some(key) => key,
            None => continue,
        };
        if key.len() * 8 != slot.length {
            Err(HsmError::InvalidArgument("key does not match its slot length"))?;
        }
        blob = blob
            .splice(slot.offset, &BitVec::from_bytes(key))
            .map_err(|_| HsmError::Corrupt(CorruptKind::Template))?;
    }

    // The flag byte sits 8 bits past flagoffset. Clear the generate-comm-keys
    // bit; clear the generate-app-key bit too when the caller brought one.
    let flag_pos = tpl.flagoffset + 8;
    let mut flag = blob
        .extract(flag_pos, 8)
        .map_err(|_| HsmError::Corrupt(CorruptKind::Template))? as u8;
    flag &= !FLAG_GENERATE_COMM_KEYS;
    if keys.has_app_key() {
        flag &= !FLAG_GENERATE_APP_KEY;
    }
    blob = blob
        .splice(flag_pos, &BitVec::from_bytes(&[flag]))
        .map_err(|_| HsmError::Corrupt(CorruptKind::Template))?;

    // Split at the encryption offset; both halves must be byte-aligned.
    let prefix = blob
        .bit_slice(0, tpl.encryptionoffset)
        .and_then(|b| b.to_bytes())
        .map_err(|_| HsmError::Corrupt(CorruptKind::Template))?;
    let suffix = blob
        .bit_slice(tpl.encryptionoffset, blob.bit_len())
        .and_then(|b| b.to_bytes())
        .map_err(|_| HsmError::Corrupt(CorruptKind::Template))?;

    // One-shot transport keys.
    let tek = Zeroizing::new(Rng::rand_key256()?);
    let tmk = Zeroizing::new(Rng::rand_key256()?);

    let suffix_ct = AesCbcAlgo::with_padding(ZERO_IV).encrypt(tek.as_ref(), &suffix)?;

    let mut inner = prefix;
    inner.extend_from_slice(&suffix_ct);
    let mut inner = pkcs7::pad(&inner, pkcs7::BLOCK_SIZE);
    let mac = CbcMac::compute(tmk.as_ref(), &inner)?;
    inner.extend_from_slice(&mac);

    // Wrap objectid || TEK || TMK under the import key.
    let import = tpl.select_import_key()?;
    let rsa = import.parse()?;
    let mut wrap_input = Zeroizing::new(Vec::with_capacity(4 + 64));
    wrap_input.extend_from_slice(&tpl.object_id_bytes()?);
    wrap_input.extend_from_slice(tek.as_ref());
    wrap_input.extend_from_slice(tmk.as_ref());
    let padded = Zeroizing::new(pkcs1::pad(
        &wrap_input,
        rsa.modulus_len(),
        Pkcs1BlockType::Bt2,
    )?);
    let wrapped = rsa.public_op(&padded)?;

    let mut out = tlv(TAG_WRAPPED_KEYS, &wrapped);
    out.extend_from_slice(&tlv(TAG_TEMPLATE_IMAGE, &inner));

    debug!(
        import_key_id = import.id,
        blob_len = out.len(),
        "template filled"
    );
    Ok(FilledTemplate {
        blob: out,
        import_key_id: import.id,
    })
}

fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(tag);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

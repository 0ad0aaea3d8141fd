//! Proximity credentials (tag UIDs)
//!
//! A credential is the raw identifier read from a proximity tag: 1 to
//! [`MAX_LEN`] bytes, compared by exact length and content. There is no
//! signing or hashing here; equality is the whole check.

use core::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Longest UID a reader can report (ISO 14443 triple-size UID)
pub const MAX_LEN: usize = 10;

/// Immutable tag identifier, 1..=MAX_LEN bytes
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    bytes: heapless::Vec<u8, MAX_LEN>,
}

impl Credential {
    /// Copy a UID out of a reader buffer.
    ///
    /// Returns `None` for an empty slice or one longer than [`MAX_LEN`].
    pub fn from_slice(uid: &[u8]) -> Option<Self> {
        if uid.is_empty() {
            return None;
        }
        let bytes = heapless::Vec::from_slice(uid).ok()?;
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    // A constructed credential is never empty; kept for clippy's len_without_is_empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.bytes)
    }
}

impl Zeroize for Credential {
    fn zeroize(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        self.bytes.clear();
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.to_hex())
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Over-long UIDs already fail inside heapless::Vec's visitor.
        let bytes = heapless::Vec::<u8, MAX_LEN>::deserialize(deserializer)?;
        Credential::from_slice(&bytes).ok_or_else(|| D::Error::custom("empty credential"))
    }
}

/// Lowercase hex, used for log lines
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0f) as usize] as char);
    }
    s
}

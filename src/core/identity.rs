//! Layer 1: Identity atoms
//!
//! Tag: dense table index, never reused
//! ObjectGuid: durable identity across renames
//! Dn / DnKey: distinguished name and its case-folded index key
//! Sid: security identifier (binary wire decode + string form)
//! SamKey / UpnKey / EmailKey: case-folded lookup keys

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, ParseError};

/// Dense table index assigned at first ingestion.
///
/// A tag identifies an entity for the lifetime of the process; deletion
/// nulls the slot but the tag is never reassigned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(u32);

impl Tag {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("tag table exceeded u32 range"))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn from_u32(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object GUID - the durable identity of a directory object.
///
/// Survives renames and moves; the GUID→tag index is injective.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectGuid(Uuid);

impl ObjectGuid {
    /// Decode the directory wire form.
    ///
    /// objectGUID arrives as 16 bytes in the Windows mixed-endian GUID
    /// layout (first three fields little-endian).
    pub fn from_ad_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 16] = bytes.try_into().map_err(|_| ParseError::Guid {
            reason: format!("expected 16 bytes, got {}", bytes.len()),
        })?;
        Ok(Self(Uuid::from_bytes_le(arr)))
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let uuid = Uuid::parse_str(s).map_err(|e| ParseError::Guid {
            reason: e.to_string(),
        })?;
        Ok(Self(uuid))
    }

    /// The wire form, for snapshot encoding.
    pub fn to_ad_bytes(self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    #[cfg(any(test, feature = "test-harness"))]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for ObjectGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectGuid({})", self.0)
    }
}

impl fmt::Display for ObjectGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguished name - hierarchical directory path.
///
/// Unique among live entities, compared case-insensitively. The original
/// casing is preserved for display; indexing goes through [`DnKey`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dn(String);

impl Dn {
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(ParseError::Dn {
                raw: s,
                reason: "empty".into(),
            }
            .into());
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn key(&self) -> DnKey {
        DnKey(self.0.to_lowercase())
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({:?})", self.0)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case-folded DN index key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DnKey(String);

impl DnKey {
    pub fn of(raw: &str) -> Self {
        Self(raw.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DnKey({:?})", self.0)
    }
}

/// Security identifier in canonical `S-1-...` string form.
///
/// Decoded from the binary wire layout: revision byte, subauthority
/// count, 48-bit big-endian identifier authority, little-endian u32
/// subauthorities.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sid(String);

impl Sid {
    const HEADER_LEN: usize = 8;
    const MAX_SUBAUTHORITIES: usize = 15;

    pub fn from_ad_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(ParseError::Sid {
                reason: format!("truncated: {} bytes", bytes.len()),
            }
            .into());
        }
        let revision = bytes[0];
        let count = bytes[1] as usize;
        if count > Self::MAX_SUBAUTHORITIES {
            return Err(ParseError::Sid {
                reason: format!("subauthority count {count} out of range"),
            }
            .into());
        }
        if bytes.len() != Self::HEADER_LEN + count * 4 {
            return Err(ParseError::Sid {
                reason: format!(
                    "length {} does not match subauthority count {count}",
                    bytes.len()
                ),
            }
            .into());
        }

        let mut authority: u64 = 0;
        for &b in &bytes[2..8] {
            authority = (authority << 8) | u64::from(b);
        }

        let mut out = format!("S-{revision}-{authority}");
        for i in 0..count {
            let off = Self::HEADER_LEN + i * 4;
            let sub = u32::from_le_bytes([
                bytes[off],
                bytes[off + 1],
                bytes[off + 2],
                bytes[off + 3],
            ]);
            out.push('-');
            out.push_str(&sub.to_string());
        }
        Ok(Self(out))
    }

    /// Parse a canonical string form (`S-1-5-21-...`).
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let raw = s.trim();
        let mut parts = raw.split('-');
        if parts.next() != Some("S") {
            return Err(ParseError::Sid {
                reason: format!("`{raw}` missing S- prefix"),
            }
            .into());
        }
        let mut numeric = 0usize;
        for part in parts {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::Sid {
                    reason: format!("`{raw}` has non-numeric component `{part}`"),
                }
                .into());
            }
            numeric += 1;
        }
        if numeric < 2 {
            return Err(ParseError::Sid {
                reason: format!("`{raw}` too short"),
            }
            .into());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The relative identifier: the final subauthority.
    ///
    /// For a group this is its primaryGroupToken.
    pub fn rid(&self) -> Option<u32> {
        self.0.rsplit('-').next()?.parse().ok()
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", self.0)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case-folded sAMAccountName index key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SamKey(String);

impl SamKey {
    pub fn of(raw: &str) -> Self {
        Self(raw.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SamKey({:?})", self.0)
    }
}

/// Case-folded userPrincipalName index key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpnKey(String);

impl UpnKey {
    pub fn of(raw: &str) -> Self {
        Self(raw.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UpnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpnKey({:?})", self.0)
    }
}

/// Case-folded email index key (primary address or alias).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmailKey(String);

impl EmailKey {
    pub fn of(raw: &str) -> Self {
        Self(raw.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EmailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmailKey({:?})", self.0)
    }
}

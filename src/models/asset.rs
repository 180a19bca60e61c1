//! Represents a versioned, lockable asset: its identifier, metadata record and
//! content digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Unique identifier of one logical asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub Uuid);

impl AssetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for AssetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which half of an asset an archive operation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Metadata,
    Content,
}

impl Facet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Facet::Metadata => "metadata",
            Facet::Content => "content",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MD5 digest of an asset's content, serialized as lowercase hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    /// Digest of a complete in-memory payload.
    pub fn of(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl From<md5::Digest> for ContentHash {
    fn from(digest: md5::Digest) -> Self {
        Self(digest.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when a hex string is not a 16-byte digest.
#[derive(Debug, thiserror::Error)]
#[error("content hash must be 32 hex characters, got `{0}`")]
pub struct InvalidContentHash(String);

impl FromStr for ContentHash {
    type Err = InvalidContentHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(InvalidContentHash(s.to_string()));
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| InvalidContentHash(s.to_string()))?;
        }
        Ok(Self(out))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The metadata record of one asset.
///
/// `lock_owner` and `locked_at` are set together: both present means the asset
/// is locked. `meta_version` and `data_version` are independent counters;
/// `etag` is a decimal counter that advances on every committed save.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Metadata {
    pub id: AssetId,

    pub etag: String,

    pub meta_version: u64,

    /// Zero until the first content save.
    pub data_version: u64,

    /// User who first saved the asset.
    pub creator: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,

    /// Declared size of the content in bytes.
    pub content_length: u64,

    /// Declared MD5 digest of the content.
    pub content_hash: ContentHash,

    /// Display name of the asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// MIME type of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    pub created: DateTime<Utc>,

    pub modified: DateTime<Utc>,

    pub last_access: DateTime<Utc>,
}

impl Metadata {
    /// A fresh, unsaved record describing content of the given length and
    /// digest. Counters and the ETag are assigned on save.
    pub fn draft(id: AssetId, content_length: u64, content_hash: ContentHash) -> Self {
        let now = Utc::now();
        Self {
            id,
            etag: String::new(),
            meta_version: 0,
            data_version: 0,
            creator: String::new(),
            lock_owner: None,
            locked_at: None,
            content_length,
            content_hash,
            name: None,
            content_type: None,
            created: now,
            modified: now,
            last_access: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    pub fn is_locked_by(&self, user: &str) -> bool {
        self.lock_owner.as_deref() == Some(user)
    }

    pub fn set_lock(&mut self, user: &str) {
        self.lock_owner = Some(user.to_string());
        self.locked_at = Some(Utc::now());
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.locked_at = None;
    }
}

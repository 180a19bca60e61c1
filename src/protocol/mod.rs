//! Request/response protocol spoken between `RemoteBackend` and a store node.
//!
//! Every message is one frame: a big-endian `u32` length followed by a JSON
//! document. Clients send an [`Envelope`] and receive exactly one
//! [`Response`] per envelope. Binary payloads travel as base64 strings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::models::asset::{AssetId, Facet};

/// Default upper bound for a single frame (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a reply arrived")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Build a framed transport over any byte stream.
pub fn framed<T>(io: T, max_frame_len: usize) -> Framed<T, LengthDelimitedCodec>
where
    T: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec();
    Framed::new(io, codec)
}

/// A request together with the caller's credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub token: String,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    StoreExists,
    CreateStore,
    CreateIndexes,
    Exists {
        id: AssetId,
    },
    ReadMetadata {
        id: AssetId,
    },
    WriteMetadata {
        id: AssetId,
        #[serde(with = "base64_bytes")]
        body: Bytes,
    },
    ReadContent {
        id: AssetId,
    },
    WriteContent {
        id: AssetId,
        #[serde(with = "base64_bytes")]
        body: Bytes,
    },
    Archive {
        id: AssetId,
        facet: Facet,
        version: u64,
    },
    ReadArchive {
        id: AssetId,
        facet: Facet,
        version: u64,
    },
    DeleteContent {
        id: AssetId,
    },
}

impl Request {
    /// Short label used in logs and progress events.
    pub fn name(&self) -> &'static str {
        match self {
            Request::StoreExists => "store_exists",
            Request::CreateStore => "create_store",
            Request::CreateIndexes => "create_indexes",
            Request::Exists { .. } => "exists",
            Request::ReadMetadata { .. } => "read_metadata",
            Request::WriteMetadata { .. } => "write_metadata",
            Request::ReadContent { .. } => "read_content",
            Request::WriteContent { .. } => "write_content",
            Request::Archive { .. } => "archive",
            Request::ReadArchive { .. } => "read_archive",
            Request::DeleteContent { .. } => "delete_content",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Exists {
        value: bool,
    },
    Bytes {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    Written {
        bytes: u64,
    },
    NotFound,
    Denied,
    Failed {
        message: String,
    },
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(frame)?)
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(raw)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

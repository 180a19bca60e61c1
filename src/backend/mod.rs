//! Storage capability consumed by the asset engine.
//!
//! The engine only ever talks to a [`Backend`]. `LocalBackend` keeps assets on
//! disk; `RemoteBackend` forwards every call to a store node as a transaction
//! on the async executor. Paths, encodings and the wire protocol stay behind
//! this trait.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;

use crate::{
    errors::AssetResult,
    models::asset::{AssetId, Facet},
};

/// A stream of content chunks, owned and sendable across tasks.
pub type ContentStream = BoxStream<'static, io::Result<Bytes>>;

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Whether a current metadata record exists for `id`.
    async fn exists(&self, id: AssetId) -> AssetResult<bool>;

    /// Encoded current metadata. `NotFound` when absent.
    async fn read_metadata(&self, id: AssetId) -> AssetResult<Bytes>;

    /// Replace the current metadata.
    async fn write_metadata(&self, id: AssetId, body: Bytes) -> AssetResult<()>;

    /// Open the current content for reading. `NotFound` when absent.
    async fn read_content(&self, id: AssetId) -> AssetResult<ContentStream>;

    /// Replace the current content with everything `body` yields and return
    /// the number of bytes stored. A failing stream leaves nothing behind.
    async fn write_content(&self, id: AssetId, body: ContentStream) -> AssetResult<u64>;

    /// Copy the current `facet` into history under `version`, overwriting a
    /// previous snapshot in that slot.
    async fn archive(&self, id: AssetId, facet: Facet, version: u64) -> AssetResult<()>;

    /// Read an archived snapshot. `NotFound` when the slot is empty.
    async fn read_archive(&self, id: AssetId, facet: Facet, version: u64) -> AssetResult<Bytes>;

    /// Remove the current content. Succeeds when nothing is stored.
    async fn delete_content(&self, id: AssetId) -> AssetResult<()>;
}

/// Wrap an in-memory payload as a one-chunk [`ContentStream`].
pub fn content_from_bytes(data: impl Into<Bytes>) -> ContentStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a [`ContentStream`] into one buffer.
pub async fn collect_content(mut stream: ContentStream) -> io::Result<Bytes> {
    use futures::StreamExt;

    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

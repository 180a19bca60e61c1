//! LocalBackend: assets on local disk.
//!
//! Every asset lives in its own directory sharded beneath
//! `root/{shard}/{shard}/{id}/`, holding `metadata.json`, `content` and a
//! `history/` folder of `{facet}.{version}` snapshots. Writes stream into a
//! temporary file that is fsynced and renamed over the target.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use super::{Backend, ContentStream};
use crate::{
    errors::{AssetError, AssetResult},
    models::asset::{AssetId, Facet},
};

const METADATA_FILE: &str = "metadata.json";
const CONTENT_FILE: &str = "content";
const HISTORY_DIR: &str = "history";

#[derive(Clone, Debug)]
pub struct LocalBackend {
    /// Base directory on disk where assets are stored.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> AssetResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|err| {
            AssetError::Instantiation(format!("storage root {}: {}", root.display(), err))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Two-level shard identifiers for an asset.
    ///
    /// Uses the first two bytes of MD5(id) as lowercase hex to keep the file
    /// count per directory low.
    fn shards(id: AssetId) -> (String, String) {
        let digest = md5::compute(id.0.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn asset_dir(&self, id: AssetId) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(id);
        let mut path = self.root.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_string());
        path
    }

    fn metadata_path(&self, id: AssetId) -> PathBuf {
        self.asset_dir(id).join(METADATA_FILE)
    }

    fn content_path(&self, id: AssetId) -> PathBuf {
        self.asset_dir(id).join(CONTENT_FILE)
    }

    fn current_path(&self, id: AssetId, facet: Facet) -> PathBuf {
        match facet {
            Facet::Metadata => self.metadata_path(id),
            Facet::Content => self.content_path(id),
        }
    }

    fn archive_path(&self, id: AssetId, facet: Facet, version: u64) -> PathBuf {
        self.asset_dir(id)
            .join(HISTORY_DIR)
            .join(format!("{}.{}", facet, version))
    }

    /// Stream `body` into a temp file next to `target`, then rename it into
    /// place. The temp file is removed on any failure.
    async fn write_atomic(&self, target: &Path, mut body: ContentStream) -> io::Result<u64> {
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("asset path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut written: u64 = 0;
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
            written += chunk.len() as u64;
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(target).await?;
                fs::rename(&tmp_path, target).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        Ok(written)
    }

    /// Remove empty directories from `start` up to (not including) the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn exists(&self, id: AssetId) -> AssetResult<bool> {
        fs::try_exists(self.metadata_path(id))
            .await
            .map_err(|err| AssetError::from_io(err, id))
    }

    async fn read_metadata(&self, id: AssetId) -> AssetResult<Bytes> {
        let body = fs::read(self.metadata_path(id))
            .await
            .map_err(|err| AssetError::from_io(err, id))?;
        Ok(Bytes::from(body))
    }

    async fn write_metadata(&self, id: AssetId, body: Bytes) -> AssetResult<()> {
        let target = self.metadata_path(id);
        self.write_atomic(&target, super::content_from_bytes(body))
            .await
            .map_err(|err| AssetError::from_io(err, id))?;
        debug!("wrote metadata {}", target.display());
        Ok(())
    }

    async fn read_content(&self, id: AssetId) -> AssetResult<ContentStream> {
        let file = File::open(self.content_path(id))
            .await
            .map_err(|err| AssetError::from_io(err, id))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn write_content(&self, id: AssetId, body: ContentStream) -> AssetResult<u64> {
        let target = self.content_path(id);
        let written = self
            .write_atomic(&target, body)
            .await
            .map_err(|err| AssetError::from_io(err, id))?;
        debug!("wrote {} content bytes to {}", written, target.display());
        Ok(written)
    }

    async fn archive(&self, id: AssetId, facet: Facet, version: u64) -> AssetResult<()> {
        let source = self.current_path(id, facet);
        let file = File::open(&source)
            .await
            .map_err(|err| AssetError::from_io(err, format!("{} {}", id, facet)))?;
        let target = self.archive_path(id, facet, version);
        self.write_atomic(&target, Box::pin(ReaderStream::new(file)))
            .await
            .map_err(|err| AssetError::from_io(err, format!("{} {} v{}", id, facet, version)))?;
        debug!("archived {} {} as version {}", id, facet, version);
        Ok(())
    }

    async fn read_archive(&self, id: AssetId, facet: Facet, version: u64) -> AssetResult<Bytes> {
        let body = fs::read(self.archive_path(id, facet, version))
            .await
            .map_err(|err| AssetError::from_io(err, format!("{} {} v{}", id, facet, version)))?;
        Ok(Bytes::from(body))
    }

    async fn delete_content(&self, id: AssetId) -> AssetResult<()> {
        let path = self.content_path(id);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed content file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("content file {} already missing", path.display());
            }
            Err(err) => return Err(AssetError::from_io(err, id)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}

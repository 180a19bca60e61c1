//! src/services/asset_store.rs
//!
//! AssetStore: the engine behind every asset operation. It enforces the
//! advisory lock kept in each asset's metadata, archives superseded
//! revisions before a save replaces them, and refuses to publish content
//! whose length or MD5 digest differs from what the metadata declares.
//!
//! Every operation on one asset id runs under that id's mutex from
//! `AssetLocks`, so a load → check → apply → persist sequence is atomic with
//! respect to other callers. The storage backend is injected at construction.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{Backend, ContentStream, content_from_bytes},
    errors::{AssetError, AssetResult},
    models::asset::{AssetId, ContentHash, Facet, Metadata},
    services::{asset_locks::AssetLocks, versioning},
};

#[derive(Clone)]
pub struct AssetStore {
    backend: Arc<dyn Backend>,
    locks: AssetLocks,
}

impl AssetStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            locks: AssetLocks::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Whether `user` may touch an asset with this metadata.
    ///
    /// Unlocked assets are open to everyone and the lock holder may always
    /// proceed. Anyone else is limited to read-only access.
    pub fn can_access(metadata: &Metadata, user: &str, read_only: bool) -> bool {
        match metadata.lock_owner.as_deref() {
            None => true,
            Some(owner) if owner == user => true,
            Some(_) => read_only,
        }
    }

    /// Read the current metadata without looking at or touching its lock.
    pub async fn load_metadata_unchecked(&self, id: AssetId) -> AssetResult<Metadata> {
        let body = self.backend.read_metadata(id).await?;
        decode_metadata(id, &body)
    }

    /// Read the current metadata, optionally refusing access when another
    /// user holds the lock and optionally taking the lock for `user`.
    pub async fn load_metadata(
        &self,
        id: AssetId,
        apply_lock: bool,
        check_lock: bool,
        user: &str,
        read_only: bool,
    ) -> AssetResult<Metadata> {
        let _guard = self.locks.acquire(id).await;
        let mut meta = self.load_metadata_unchecked(id).await?;
        if check_lock {
            ensure_access(&meta, user, read_only)?;
        }
        if apply_lock {
            self.lock_record(&mut meta, user).await?;
        }
        Ok(meta)
    }

    /// Lock `id` for `user`. A no-op when `user` already holds it.
    pub async fn apply_lock(&self, id: AssetId, user: &str) -> AssetResult<Metadata> {
        let _guard = self.locks.acquire(id).await;
        let mut meta = self.load_metadata_unchecked(id).await?;
        self.lock_record(&mut meta, user).await?;
        Ok(meta)
    }

    /// Lock the asset described by `metadata` for `user` and persist it.
    pub async fn apply_lock_to(&self, metadata: &mut Metadata, user: &str) -> AssetResult<()> {
        let _guard = self.locks.acquire(metadata.id).await;
        self.lock_record(metadata, user).await
    }

    /// Clear the lock on `id`.
    ///
    /// Does not verify that `user` holds the lock; releasing somebody else's
    /// lock succeeds and is logged.
    pub async fn release_lock(&self, id: AssetId, user: &str) -> AssetResult<Metadata> {
        let _guard = self.locks.acquire(id).await;
        let mut meta = self.load_metadata_unchecked(id).await?;
        self.unlock_record(&mut meta, user).await?;
        Ok(meta)
    }

    /// Clear the lock on the asset described by `metadata` and persist it.
    pub async fn release_lock_from(&self, metadata: &mut Metadata, user: &str) -> AssetResult<()> {
        let _guard = self.locks.acquire(metadata.id).await;
        self.unlock_record(metadata, user).await
    }

    /// Metadata for `user`, locking the asset unless `read_only`.
    pub async fn get_metadata(
        &self,
        id: AssetId,
        user: &str,
        read_only: bool,
    ) -> AssetResult<Metadata> {
        let _guard = self.locks.acquire(id).await;
        self.open(id, user, read_only).await
    }

    /// Metadata plus a stream over the current content, with the same lock
    /// handling as [`AssetStore::get_metadata`].
    pub async fn get_content(
        &self,
        id: AssetId,
        user: &str,
        read_only: bool,
    ) -> AssetResult<(Metadata, ContentStream)> {
        let _guard = self.locks.acquire(id).await;
        let meta = self.open(id, user, read_only).await?;
        if meta.data_version == 0 {
            return Err(AssetError::NotFound(format!("{} has no content", id)));
        }
        let stream = self.backend.read_content(id).await?;
        debug!("opened content of {} at data version {}", id, meta.data_version);
        Ok((meta, stream))
    }

    /// An earlier metadata revision, or the current one when `version` is
    /// the current `meta_version`.
    pub async fn get_metadata_revision(&self, id: AssetId, version: u64) -> AssetResult<Metadata> {
        let current = self.load_metadata_unchecked(id).await?;
        if version == current.meta_version {
            return Ok(current);
        }
        let body = self.backend.read_archive(id, Facet::Metadata, version).await?;
        decode_metadata(id, &body)
    }

    /// Save descriptive metadata.
    ///
    /// The first save of an id creates revision 1. Later saves archive the
    /// current record under its `meta_version` and persist the next revision.
    /// The lock ends up held by `user` unless `release_lock_after`.
    pub async fn save_metadata(
        &self,
        incoming: Metadata,
        user: &str,
        release_lock_after: bool,
    ) -> AssetResult<Metadata> {
        let id = incoming.id;
        let _guard = self.locks.acquire(id).await;

        let mut next = match self.load_existing(id).await? {
            None => {
                debug!("creating asset {}", id);
                versioning::first_revision(incoming, user)
            }
            Some(current) => {
                self.backend
                    .archive(id, Facet::Metadata, current.meta_version)
                    .await
                    .map_err(archive_failed)?;
                let mut next = versioning::next_metadata_revision(&current, &incoming);
                end_session(&mut next, user);
                next
            }
        };
        settle_lock(&mut next, user, release_lock_after);

        self.persist(&next).await?;
        info!(
            "saved metadata of {} (meta v{}, etag {})",
            id, next.meta_version, next.etag
        );
        Ok(next)
    }

    /// Store new content for an existing asset.
    ///
    /// The bytes must match the `content_length` and `content_hash` declared
    /// by the current metadata. On a mismatch the written bytes are deleted,
    /// the previous content is put back and the metadata is left untouched.
    ///
    /// The save runs on its own task holding the asset guard: once started it
    /// reaches a verified or restored state even if the caller is dropped.
    pub async fn save_content(
        &self,
        id: AssetId,
        body: ContentStream,
        user: &str,
        release_lock_after: bool,
    ) -> AssetResult<Metadata> {
        let guard = self.locks.acquire(id).await;
        let store = self.clone();
        let user = user.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            store
                .replace_content(id, body, &user, release_lock_after)
                .await
        });
        task.await.map_err(|err| {
            error!("content save of {} did not finish: {}", id, err);
            AssetError::Failure(format!("content save of {} did not finish: {}", id, err))
        })?
    }

    /// Archive, write, verify, persist. Caller holds the asset guard.
    async fn replace_content(
        &self,
        id: AssetId,
        body: ContentStream,
        user: &str,
        release_lock_after: bool,
    ) -> AssetResult<Metadata> {
        let current = self.load_metadata_unchecked(id).await?;
        let archived = self.archive_content(&current).await?;

        let tally = Arc::new(Mutex::new(Tally::new()));
        let observed = {
            let tally = tally.clone();
            body.inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    tally
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .consume(chunk);
                }
            })
        };
        let written = self.backend.write_content(id, Box::pin(observed)).await?;
        let digest = {
            let mut tally = tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tally).finish()
        };

        if written != current.content_length {
            let mismatch = AssetError::LengthMismatch {
                expected: current.content_length,
                actual: written,
            };
            return Err(self.discard_write(id, archived, mismatch).await);
        }
        if digest != current.content_hash {
            let mismatch = AssetError::HashMismatch {
                expected: current.content_hash.to_hex(),
                actual: digest.to_hex(),
            };
            return Err(self.discard_write(id, archived, mismatch).await);
        }

        let mut next = versioning::next_content_revision(&current);
        end_session(&mut next, user);
        settle_lock(&mut next, user, release_lock_after);
        if let Err(err) = self.persist(&next).await {
            return Err(self.discard_write(id, archived, err).await);
        }
        info!(
            "saved content of {} ({} bytes, data v{}, etag {})",
            id, written, next.data_version, next.etag
        );
        Ok(next)
    }

    /// Archive the current content under its data version. Returns the
    /// version archived, or `None` when there was nothing to archive.
    async fn archive_content(&self, current: &Metadata) -> AssetResult<Option<u64>> {
        let Some(version) = versioning::archive_slot(current, Facet::Content) else {
            return Ok(None);
        };
        match self.backend.archive(current.id, Facet::Content, version).await {
            Ok(()) => Ok(Some(version)),
            Err(AssetError::NotFound(_)) => {
                warn!(
                    "content v{} of {} is missing, saving without archiving it",
                    version, current.id
                );
                Ok(None)
            }
            Err(err) => Err(archive_failed(err)),
        }
    }

    /// Load current metadata, treating a missing record as `None`.
    async fn load_existing(&self, id: AssetId) -> AssetResult<Option<Metadata>> {
        match self.load_metadata_unchecked(id).await {
            Ok(meta) => Ok(Some(meta)),
            Err(AssetError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Shared read path of `get_metadata` and `get_content`. Caller holds
    /// the asset guard.
    async fn open(&self, id: AssetId, user: &str, read_only: bool) -> AssetResult<Metadata> {
        let mut meta = self.load_metadata_unchecked(id).await?;
        ensure_access(&meta, user, read_only)?;
        meta.last_access = Utc::now();
        if !read_only {
            self.lock_record(&mut meta, user).await?;
        }
        Ok(meta)
    }

    async fn lock_record(&self, meta: &mut Metadata, user: &str) -> AssetResult<()> {
        if meta.is_locked_by(user) {
            return Ok(());
        }
        if let Some(owner) = meta.lock_owner.as_deref() {
            debug!("moving lock on {} from `{}` to `{}`", meta.id, owner, user);
        }
        let mut next = meta.clone();
        next.set_lock(user);
        next.etag = versioning::next_etag(&meta.etag);
        self.persist(&next).await?;
        debug!("locked {} for `{}`", next.id, user);
        *meta = next;
        Ok(())
    }

    async fn unlock_record(&self, meta: &mut Metadata, user: &str) -> AssetResult<()> {
        match meta.lock_owner.as_deref() {
            None => return Ok(()),
            Some(owner) if owner != user => {
                warn!(
                    "`{}` released the lock on {} held by `{}`",
                    user, meta.id, owner
                );
            }
            Some(_) => {}
        }
        let mut next = meta.clone();
        next.clear_lock();
        next.etag = versioning::next_etag(&meta.etag);
        self.persist(&next).await?;
        debug!("unlocked {}", next.id);
        *meta = next;
        Ok(())
    }

    async fn persist(&self, meta: &Metadata) -> AssetResult<()> {
        let body = serde_json::to_vec(meta).map_err(|err| {
            error!("could not encode metadata of {}: {}", meta.id, err);
            AssetError::Failure(format!("encoding metadata of {}: {}", meta.id, err))
        })?;
        self.backend.write_metadata(meta.id, Bytes::from(body)).await
    }

    /// Replace content that failed verification with the revision archived
    /// under `archived`, or remove it when there is none. Returns the error
    /// the save reports: `cause`, or an i/o error naming both when the
    /// cleanup itself failed.
    async fn discard_write(
        &self,
        id: AssetId,
        archived: Option<u64>,
        cause: AssetError,
    ) -> AssetError {
        let cleaned = match archived {
            Some(version) => self.restore_content(id, version).await,
            None => self.backend.delete_content(id).await,
        };
        match cleaned {
            Ok(()) => cause,
            Err(err) => {
                error!("could not clean up content of {} after {}: {}", id, cause, err);
                AssetError::Io(format!("{}; previous content not restored: {}", cause, err))
            }
        }
    }

    /// Put archived content back as current. The rejected bytes are removed
    /// even when the archive cannot be read back.
    async fn restore_content(&self, id: AssetId, version: u64) -> AssetResult<()> {
        let restored = match self.backend.read_archive(id, Facet::Content, version).await {
            Ok(previous) => self
                .backend
                .write_content(id, content_from_bytes(previous))
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = restored {
            self.backend.delete_content(id).await?;
            return Err(err);
        }
        debug!("restored content of {} from version {}", id, version);
        Ok(())
    }
}

/// Running byte count and MD5 of a content upload.
struct Tally {
    len: u64,
    digest: Context,
}

impl Tally {
    fn new() -> Self {
        Self {
            len: 0,
            digest: Context::new(),
        }
    }

    fn consume(&mut self, chunk: &[u8]) {
        self.len += chunk.len() as u64;
        self.digest.consume(chunk);
    }

    fn finish(self) -> ContentHash {
        debug!("digested {} bytes", self.len);
        self.digest.compute().into()
    }
}

impl Default for Tally {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_access(meta: &Metadata, user: &str, read_only: bool) -> AssetResult<()> {
    if AssetStore::can_access(meta, user, read_only) {
        return Ok(());
    }
    Err(AssetError::ResourceLocked {
        id: meta.id,
        owner: meta.lock_owner.clone().unwrap_or_default(),
    })
}

/// A save concludes the editing session that held the lock, whoever held it.
fn end_session(meta: &mut Metadata, user: &str) {
    if meta.is_locked() && !meta.is_locked_by(user) {
        warn!(
            "`{}` saved {} while it was locked by `{}`",
            user,
            meta.id,
            meta.lock_owner.as_deref().unwrap_or_default()
        );
    }
    meta.clear_lock();
}

/// Leave the lock with `user`, or clear it when the save ends the session.
fn settle_lock(meta: &mut Metadata, user: &str, release_lock_after: bool) {
    if release_lock_after {
        meta.clear_lock();
    } else {
        meta.set_lock(user);
    }
}

/// Archive failures abort a save as i/o errors; transport outcomes pass
/// through unchanged.
fn archive_failed(err: AssetError) -> AssetError {
    match err {
        AssetError::Io(_) | AssetError::Timeout | AssetError::AuthorizationDenied => err,
        other => AssetError::Io(format!("archiving failed: {}", other)),
    }
}

fn decode_metadata(id: AssetId, body: &[u8]) -> AssetResult<Metadata> {
    serde_json::from_slice(body).map_err(|err| AssetError::Deserialization {
        id,
        reason: err.to_string(),
    })
}

//! Version bookkeeping applied on every save.
//!
//! A save either creates the first revision of an asset or derives the next
//! revision from the one currently persisted. Archiving the superseded
//! revision is the caller's job; this module only decides which version slot
//! it goes to and what the new record looks like.

use chrono::Utc;

use crate::models::asset::{Facet, Metadata};

/// ETag of the first persisted revision.
pub const INITIAL_ETAG: &str = "1";

/// The record persisted by the first metadata save of an asset.
pub fn first_revision(mut draft: Metadata, user: &str) -> Metadata {
    let now = Utc::now();
    draft.etag = INITIAL_ETAG.to_string();
    draft.meta_version = 1;
    draft.data_version = 0;
    if draft.creator.is_empty() {
        draft.creator = user.to_string();
    }
    draft.created = now;
    draft.modified = now;
    draft.last_access = now;
    draft
}

/// ETag following `current`. A non-numeric tag is treated as the first one.
pub fn next_etag(current: &str) -> String {
    current.parse::<u64>().unwrap_or(1).saturating_add(1).to_string()
}

/// Version slot the current `facet` of `current` is archived under, or
/// `None` when there is nothing to archive yet.
pub fn archive_slot(current: &Metadata, facet: Facet) -> Option<u64> {
    let version = match facet {
        Facet::Metadata => current.meta_version,
        Facet::Content => current.data_version,
    };
    (version >= 1).then_some(version)
}

/// The revision that replaces `current` after a metadata save.
///
/// Counter, ETag and timestamps are derived from `current`; descriptive
/// fields come from `incoming`. Identity, creator, creation time and the
/// content counter are kept. The lock is left as in `current` for the caller
/// to settle.
pub fn next_metadata_revision(current: &Metadata, incoming: &Metadata) -> Metadata {
    let mut next = current.clone();
    next.meta_version = current.meta_version + 1;
    next.etag = next_etag(&current.etag);
    next.content_length = incoming.content_length;
    next.content_hash = incoming.content_hash;
    next.name = incoming.name.clone();
    next.content_type = incoming.content_type.clone();
    next.modified = Utc::now();
    next
}

/// The revision that replaces `current` after verified content was stored.
pub fn next_content_revision(current: &Metadata) -> Metadata {
    let mut next = current.clone();
    next.data_version = current.data_version + 1;
    next.etag = next_etag(&current.etag);
    next.modified = Utc::now();
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::{AssetId, ContentHash};

    fn draft() -> Metadata {
        Metadata::draft(AssetId::new(), 5, ContentHash::of(b"hello"))
    }

    #[test]
    fn first_revision_starts_counters() {
        let meta = first_revision(draft(), "alice");
        assert_eq!(meta.etag, "1");
        assert_eq!(meta.meta_version, 1);
        assert_eq!(meta.data_version, 0);
        assert_eq!(meta.creator, "alice");
    }

    #[test]
    fn first_revision_keeps_explicit_creator() {
        let mut incoming = draft();
        incoming.creator = "importer".into();
        assert_eq!(first_revision(incoming, "alice").creator, "importer");
    }

    #[test]
    fn etag_counts_up() {
        assert_eq!(next_etag("1"), "2");
        assert_eq!(next_etag("41"), "42");
        assert_eq!(next_etag("garbage"), "2");
    }

    #[test]
    fn counters_advance_independently() {
        let v1 = first_revision(draft(), "alice");

        let mut incoming = v1.clone();
        incoming.name = Some("report.txt".into());
        incoming.meta_version = 99;
        incoming.data_version = 99;
        let v2 = next_metadata_revision(&v1, &incoming);
        assert_eq!(v2.meta_version, 2);
        assert_eq!(v2.data_version, 0);
        assert_eq!(v2.etag, "2");
        assert_eq!(v2.name.as_deref(), Some("report.txt"));
        assert_eq!(v2.created, v1.created);

        let v3 = next_content_revision(&v2);
        assert_eq!(v3.meta_version, 2);
        assert_eq!(v3.data_version, 1);
        assert_eq!(v3.etag, "3");
    }

    #[test]
    fn nothing_to_archive_before_first_content() {
        let v1 = first_revision(draft(), "alice");
        assert_eq!(archive_slot(&v1, Facet::Metadata), Some(1));
        assert_eq!(archive_slot(&v1, Facet::Content), None);
        assert_eq!(
            archive_slot(&next_content_revision(&v1), Facet::Content),
            Some(1)
        );
    }
}

//! Core data models of the asset store.
//!
//! An asset is a metadata record plus one binary payload. Both serialize as
//! JSON via `serde`.

pub mod asset;

//! Defines routes for all asset operations.
//!
//! ## Structure
//! - **Metadata**
//!   - `GET    /assets/{id}/metadata`: read (locks unless `?read_only=true`)
//!   - `PUT    /assets/{id}/metadata`: save (`?release_lock=false` keeps the lock)
//!   - `GET    /assets/{id}/metadata/versions/{version}`: archived revision
//!
//! - **Content**
//!   - `GET    /assets/{id}/content`: download
//!   - `PUT    /assets/{id}/content`: upload, verified against the metadata
//!
//! - **Lock**
//!   - `POST   /assets/{id}/lock`: take the lock
//!   - `DELETE /assets/{id}/lock`: release it

use crate::{
    handlers::{
        asset_handlers::{
            get_content, get_metadata, get_metadata_revision, lock_asset, save_content,
            save_metadata, unlock_asset,
        },
        health_handlers::{healthz, readyz},
    },
    services::asset_store::AssetStore,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all asset routes.
///
/// The router carries the shared `AssetStore` to all handlers.
pub fn routes() -> Router<AssetStore> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/assets/{id}/metadata",
            get(get_metadata).put(save_metadata),
        )
        .route(
            "/assets/{id}/metadata/versions/{version}",
            get(get_metadata_revision),
        )
        .route("/assets/{id}/content", get(get_content).put(save_content))
        .route("/assets/{id}/lock", post(lock_asset).delete(unlock_asset))
}

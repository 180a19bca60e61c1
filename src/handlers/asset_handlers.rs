//! HTTP handlers for asset operations.
//! Streams content bodies in both directions and delegates every decision to
//! `AssetStore`. The acting user comes from the `x-asset-user` header.

use crate::{
    errors::{AppError, OpResult},
    models::asset::{AssetId, ContentHash, Metadata},
    services::asset_store::AssetStore,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;

pub const USER_HEADER: &str = "x-asset-user";

/// `?read_only=` on reads; defaults to a locking read.
#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    #[serde(default)]
    pub read_only: bool,
}

/// `?release_lock=` on saves; defaults to ending the editing session.
#[derive(Debug, Deserialize)]
pub struct SaveQuery {
    #[serde(default = "default_release_lock")]
    pub release_lock: bool,
}

fn default_release_lock() -> bool {
    true
}

/// Body of `PUT /assets/{id}/metadata`.
#[derive(Debug, Deserialize)]
pub struct MetadataBody {
    pub content_length: u64,
    pub content_hash: ContentHash,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub creator: Option<String>,
}

fn acting_user(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request(format!("missing `{}` header", USER_HEADER)))
}

/// GET `/assets/{id}/metadata`
pub async fn get_metadata(
    State(store): State<AssetStore>,
    Path(id): Path<AssetId>,
    Query(q): Query<AccessQuery>,
    headers: HeaderMap,
) -> Result<OpResult<Metadata>, AppError> {
    let user = acting_user(&headers)?;
    let meta = store.get_metadata(id, &user, q.read_only).await?;
    Ok(OpResult::success(meta))
}

/// GET `/assets/{id}/metadata/versions/{version}`
pub async fn get_metadata_revision(
    State(store): State<AssetStore>,
    Path((id, version)): Path<(AssetId, u64)>,
) -> Result<OpResult<Metadata>, AppError> {
    let meta = store.get_metadata_revision(id, version).await?;
    Ok(OpResult::success(meta))
}

/// PUT `/assets/{id}/metadata`
pub async fn save_metadata(
    State(store): State<AssetStore>,
    Path(id): Path<AssetId>,
    Query(q): Query<SaveQuery>,
    headers: HeaderMap,
    Json(body): Json<MetadataBody>,
) -> Result<OpResult<Metadata>, AppError> {
    let user = acting_user(&headers)?;
    let mut incoming = Metadata::draft(id, body.content_length, body.content_hash);
    incoming.name = body.name;
    incoming.content_type = body.content_type;
    incoming.creator = body.creator.unwrap_or_default();

    let saved = store.save_metadata(incoming, &user, q.release_lock).await?;
    Ok(OpResult::success(saved))
}

/// GET `/assets/{id}/content` as a streaming response.
pub async fn get_content(
    State(store): State<AssetStore>,
    Path(id): Path<AssetId>,
    Query(q): Query<AccessQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user = acting_user(&headers)?;
    let (meta, stream) = store.get_content(id, &user, q.read_only).await?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_asset_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// PUT `/assets/{id}/content`: body is streamed straight to the backend.
pub async fn save_content(
    State(store): State<AssetStore>,
    Path(id): Path<AssetId>,
    Query(q): Query<SaveQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<OpResult<Metadata>, AppError> {
    let user = acting_user(&headers)?;
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let saved = store
        .save_content(id, Box::pin(stream), &user, q.release_lock)
        .await?;
    Ok(OpResult::success(saved))
}

/// POST `/assets/{id}/lock`: take the lock, refusing if another user holds it.
pub async fn lock_asset(
    State(store): State<AssetStore>,
    Path(id): Path<AssetId>,
    headers: HeaderMap,
) -> Result<OpResult<Metadata>, AppError> {
    let user = acting_user(&headers)?;
    let meta = store.load_metadata(id, true, true, &user, false).await?;
    Ok(OpResult::success(meta))
}

/// DELETE `/assets/{id}/lock`
pub async fn unlock_asset(
    State(store): State<AssetStore>,
    Path(id): Path<AssetId>,
    headers: HeaderMap,
) -> Result<OpResult<Metadata>, AppError> {
    let user = acting_user(&headers)?;
    let meta = store.release_lock(id, &user).await?;
    Ok(OpResult::success(meta))
}

fn set_asset_headers(headers: &mut HeaderMap, meta: &Metadata) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.content_length));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    headers.insert(
        HeaderName::from_static("x-asset-data-version"),
        HeaderValue::from(meta.data_version),
    );
    if let Some(owner) = meta.lock_owner.as_deref() {
        if let Ok(value) = HeaderValue::from_str(owner) {
            headers.insert(HeaderName::from_static("x-asset-lock-owner"), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::local::LocalBackend, errors::ResultCode, routes::routes::routes};
    use axum::{Router, http::Request};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn router() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalBackend::open(dir.path()).await.expect("backend");
        let store = AssetStore::new(Arc::new(backend));
        (dir, routes().with_state(store))
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, bytes::Bytes) {
        let response = router.clone().oneshot(req).await.expect("route request");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("read body");
        (status, headers, body)
    }

    fn put_metadata(id: AssetId, user: &str, payload: &[u8], release: bool) -> Request<Body> {
        let body = json!({
            "content_length": payload.len(),
            "content_hash": ContentHash::of(payload).to_hex(),
            "name": "notes.txt",
            "content_type": "text/plain",
        });
        Request::builder()
            .method("PUT")
            .uri(format!("/assets/{}/metadata?release_lock={}", id, release))
            .header(USER_HEADER, user)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn save_then_download_over_http() {
        let (_dir, router) = router().await;
        let id = AssetId::new();

        let (status, _, body) = send(&router, put_metadata(id, "alice", b"hello", false)).await;
        assert_eq!(status, StatusCode::OK);
        let reply: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["code"], "success");
        assert_eq!(reply["payload"]["etag"], "1");
        assert_eq!(reply["payload"]["lock_owner"], "alice");

        let upload = Request::builder()
            .method("PUT")
            .uri(format!("/assets/{}/content", id))
            .header(USER_HEADER, "alice")
            .body(Body::from("hello"))
            .unwrap();
        let (status, _, body) = send(&router, upload).await;
        assert_eq!(status, StatusCode::OK);
        let reply: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["payload"]["data_version"], 1);

        let download = Request::builder()
            .uri(format!("/assets/{}/content?read_only=true", id))
            .header(USER_HEADER, "bob")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&router, download).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::ETAG], "\"2\"");
    }

    #[tokio::test]
    async fn lock_conflict_maps_to_423() {
        let (_dir, router) = router().await;
        let id = AssetId::new();
        send(&router, put_metadata(id, "alice", b"x", false)).await;

        let take = Request::builder()
            .method("POST")
            .uri(format!("/assets/{}/lock", id))
            .header(USER_HEADER, "bob")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&router, take).await;
        assert_eq!(status, StatusCode::LOCKED);
        let reply: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["code"], "resource_locked");
        assert!(reply.get("payload").is_none());

        let release = Request::builder()
            .method("DELETE")
            .uri(format!("/assets/{}/lock", id))
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&router, release).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn integrity_failure_maps_to_422() {
        let (_dir, router) = router().await;
        let id = AssetId::new();
        send(&router, put_metadata(id, "alice", b"abcd", false)).await;

        let upload = Request::builder()
            .method("PUT")
            .uri(format!("/assets/{}/content", id))
            .header(USER_HEADER, "alice")
            .body(Body::from("abc"))
            .unwrap();
        let (status, _, body) = send(&router, upload).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let reply: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["code"], "length_mismatch");
    }

    #[tokio::test]
    async fn missing_user_and_unknown_asset() {
        let (_dir, router) = router().await;
        let no_user = Request::builder()
            .uri(format!("/assets/{}/metadata", AssetId::new()))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&router, no_user).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = Request::builder()
            .uri(format!("/assets/{}/metadata", AssetId::new()))
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&router, unknown).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let reply: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["code"], serde_json::to_value(ResultCode::NotFound).unwrap());
    }

    #[tokio::test]
    async fn revisions_are_browsable() {
        let (_dir, router) = router().await;
        let id = AssetId::new();
        send(&router, put_metadata(id, "alice", b"one", true)).await;
        send(&router, put_metadata(id, "alice", b"two", true)).await;

        let first = Request::builder()
            .uri(format!("/assets/{}/metadata/versions/1", id))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&router, first).await;
        assert_eq!(status, StatusCode::OK);
        let reply: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["payload"]["meta_version"], 1);
        assert_eq!(
            reply["payload"]["content_hash"],
            ContentHash::of(b"one").to_hex()
        );
    }
}

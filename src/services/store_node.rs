//! src/services/store_node.rs
//!
//! StoreNode: the networked store behind `RemoteBackend`. Listens on TCP,
//! reads length-delimited request frames and answers each one from SQLite.
//! Tables and indexes are created on demand by the client-driven `provision`
//! process; requests against an unprovisioned store answer `failed`.

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use sqlx::SqlitePool;
use std::{io, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    models::asset::{AssetId, Facet},
    protocol::{self, Envelope, ProtocolError, Request, Response},
};

const STORE_TABLES: [&str; 3] = ["asset_metadata", "asset_content", "asset_history"];

const CREATE_STORE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS asset_metadata (
    asset_id   TEXT PRIMARY KEY NOT NULL,
    body       BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS asset_content (
    asset_id   TEXT PRIMARY KEY NOT NULL,
    body       BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS asset_history (
    asset_id    TEXT NOT NULL,
    facet       TEXT NOT NULL,
    version     INTEGER NOT NULL,
    body        BLOB NOT NULL,
    archived_at TEXT NOT NULL,
    PRIMARY KEY (asset_id, facet, version)
)
"#;

const CREATE_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_asset_history_asset ON asset_history (asset_id, facet)
"#;

#[derive(Clone)]
pub struct StoreNode {
    /// Shared SQLite connection pool holding every asset.
    pub db: Arc<SqlitePool>,

    /// Credential clients must present; empty accepts everyone.
    token: String,

    max_frame_len: usize,
}

impl StoreNode {
    pub fn new(db: Arc<SqlitePool>, token: impl Into<String>, max_frame_len: usize) -> Self {
        Self {
            db,
            token: token.into(),
            max_frame_len,
        }
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        info!("store node listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let node = self.clone();
            tokio::spawn(async move {
                debug!("store node accepted {}", peer);
                if let Err(err) = node.handle_connection(stream).await {
                    debug!("connection from {} ended: {}", peer, err);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ProtocolError> {
        stream.set_nodelay(true)?;
        let mut conn = protocol::framed(stream, self.max_frame_len);
        while let Some(frame) = conn.next().await {
            let frame = frame?;
            let response = match protocol::decode::<Envelope>(&frame) {
                Ok(envelope) => self.handle(envelope).await,
                Err(err) => Response::Failed {
                    message: err.to_string(),
                },
            };
            conn.send(protocol::encode(&response)?).await?;
        }
        Ok(())
    }

    /// Authenticate and answer one request.
    pub async fn handle(&self, envelope: Envelope) -> Response {
        if !self.token.is_empty() && envelope.token != self.token {
            warn!("rejected `{}` with a bad token", envelope.request.name());
            return Response::Denied;
        }
        let name = envelope.request.name();
        match self.dispatch(envelope.request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("`{}` failed: {}", name, err);
                Response::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response, sqlx::Error> {
        match request {
            Request::StoreExists => {
                let found: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (?, ?, ?)",
                )
                .bind(STORE_TABLES[0])
                .bind(STORE_TABLES[1])
                .bind(STORE_TABLES[2])
                .fetch_one(&*self.db)
                .await?;
                Ok(Response::Exists {
                    value: found == STORE_TABLES.len() as i64,
                })
            }
            Request::CreateStore => {
                self.execute_script(CREATE_STORE_SQL).await?;
                info!("created store tables");
                Ok(Response::Ok)
            }
            Request::CreateIndexes => {
                self.execute_script(CREATE_INDEXES_SQL).await?;
                Ok(Response::Ok)
            }
            Request::Exists { id } => {
                let row: Option<i64> =
                    sqlx::query_scalar("SELECT 1 FROM asset_metadata WHERE asset_id = ?")
                        .bind(id.to_string())
                        .fetch_optional(&*self.db)
                        .await?;
                Ok(Response::Exists {
                    value: row.is_some(),
                })
            }
            Request::ReadMetadata { id } => self.read_current("asset_metadata", id).await,
            Request::WriteMetadata { id, body } => {
                self.write_current("asset_metadata", id, &body).await?;
                Ok(Response::Ok)
            }
            Request::ReadContent { id } => self.read_current("asset_content", id).await,
            Request::WriteContent { id, body } => {
                self.write_current("asset_content", id, &body).await?;
                Ok(Response::Written {
                    bytes: body.len() as u64,
                })
            }
            Request::Archive { id, facet, version } => {
                let sql = format!(
                    "INSERT INTO asset_history (asset_id, facet, version, body, archived_at)
                     SELECT asset_id, ?, ?, body, ? FROM {} WHERE asset_id = ?
                     ON CONFLICT(asset_id, facet, version) DO UPDATE SET
                        body = excluded.body,
                        archived_at = excluded.archived_at",
                    current_table(facet)
                );
                let result = sqlx::query(&sql)
                    .bind(facet.as_str())
                    .bind(version_param(version)?)
                    .bind(Utc::now())
                    .bind(id.to_string())
                    .execute(&*self.db)
                    .await?;
                if result.rows_affected() == 0 {
                    return Ok(Response::NotFound);
                }
                Ok(Response::Ok)
            }
            Request::ReadArchive { id, facet, version } => {
                let body: Option<Vec<u8>> = sqlx::query_scalar(
                    "SELECT body FROM asset_history WHERE asset_id = ? AND facet = ? AND version = ?",
                )
                .bind(id.to_string())
                .bind(facet.as_str())
                .bind(version_param(version)?)
                .fetch_optional(&*self.db)
                .await?;
                Ok(body.map_or(Response::NotFound, |data| Response::Bytes {
                    data: Bytes::from(data),
                }))
            }
            Request::DeleteContent { id } => {
                sqlx::query("DELETE FROM asset_content WHERE asset_id = ?")
                    .bind(id.to_string())
                    .execute(&*self.db)
                    .await?;
                Ok(Response::Ok)
            }
        }
    }

    async fn read_current(&self, table: &str, id: AssetId) -> Result<Response, sqlx::Error> {
        let body: Option<Vec<u8>> =
            sqlx::query_scalar(&format!("SELECT body FROM {} WHERE asset_id = ?", table))
                .bind(id.to_string())
                .fetch_optional(&*self.db)
                .await?;
        Ok(body.map_or(Response::NotFound, |data| Response::Bytes {
            data: Bytes::from(data),
        }))
    }

    async fn write_current(&self, table: &str, id: AssetId, body: &[u8]) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (asset_id, body, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(asset_id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
            table
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(body)
            .bind(Utc::now())
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Run a `;`-separated script one statement at a time.
    async fn execute_script(&self, script: &str) -> Result<(), sqlx::Error> {
        let statements = script
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());
        for stmt in statements {
            debug!("executing store SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

fn current_table(facet: Facet) -> &'static str {
    match facet {
        Facet::Metadata => "asset_metadata",
        Facet::Content => "asset_content",
    }
}

fn version_param(version: u64) -> Result<i64, sqlx::Error> {
    i64::try_from(version).map_err(|err| sqlx::Error::Protocol(format!("version {}: {}", version, err)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        backend::{
            Backend,
            remote::{RemoteBackend, RetryPolicy},
        },
        errors::ResultCode,
        executor::{ConnectOptions, Outcome, TcpConnector, Transaction},
    };
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    pub(crate) const TOKEN: &str = "node-secret";

    /// Start a node on an in-memory database and return its address.
    pub(crate) async fn spawn_node() -> String {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let node = StoreNode::new(Arc::new(db), TOKEN, protocol::DEFAULT_MAX_FRAME_LEN);
        tokio::spawn(node.serve(listener));
        addr
    }

    pub(crate) fn remote(addr: &str, token: &str) -> RemoteBackend {
        RemoteBackend::new(
            TcpConnector::new(addr),
            ConnectOptions {
                token: token.into(),
                timeout: Duration::from_secs(5),
                ..ConnectOptions::default()
            },
            RetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let addr = spawn_node().await;
        let backend = remote(&addr, TOKEN);
        backend.provision().await.unwrap();

        // Second run sees the store and skips creation.
        let mut tx = Transaction::new(
            crate::backend::remote::provision_process(),
            TcpConnector::new(addr.as_str()),
            ConnectOptions {
                token: TOKEN.into(),
                ..ConnectOptions::default()
            },
        );
        let _events = tx.subscribe();
        let outcome = tx.execute().outcome().await;
        assert_eq!(
            outcome,
            Outcome::Completed(vec![Response::Exists { value: true }, Response::Ok])
        );
    }

    #[tokio::test]
    async fn unprovisioned_store_fails_requests() {
        let addr = spawn_node().await;
        let err = remote(&addr, TOKEN)
            .read_metadata(AssetId::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::IoError);
    }

    #[tokio::test]
    async fn bad_token_is_denied() {
        let addr = spawn_node().await;
        let err = remote(&addr, "wrong").provision().await.unwrap_err();
        assert_eq!(err.code(), ResultCode::AuthorizationDenied);
    }

    #[tokio::test]
    async fn backend_operations_roundtrip_through_sqlite() {
        let addr = spawn_node().await;
        let backend = remote(&addr, TOKEN);
        backend.provision().await.unwrap();
        let id = AssetId::new();

        assert!(!backend.exists(id).await.unwrap());
        backend
            .write_metadata(id, Bytes::from_static(b"meta-1"))
            .await
            .unwrap();
        assert!(backend.exists(id).await.unwrap());

        backend.archive(id, Facet::Metadata, 1).await.unwrap();
        backend
            .write_metadata(id, Bytes::from_static(b"meta-2"))
            .await
            .unwrap();
        assert_eq!(
            backend.read_archive(id, Facet::Metadata, 1).await.unwrap(),
            Bytes::from_static(b"meta-1")
        );
        assert_eq!(
            backend.read_metadata(id).await.unwrap(),
            Bytes::from_static(b"meta-2")
        );

        let written = backend
            .write_content(id, crate::backend::content_from_bytes("payload"))
            .await
            .unwrap();
        assert_eq!(written, 7);
        let body = crate::backend::collect_content(backend.read_content(id).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&body[..], b"payload");

        backend.delete_content(id).await.unwrap();
        let err = backend.read_content(id).await.err().unwrap();
        assert_eq!(err.code(), ResultCode::NotFound);

        let err = backend.archive(id, Facet::Content, 1).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::NotFound);
    }
}

//! RemoteBackend: assets held by a store node.
//!
//! Each backend call runs as its own transaction on the async executor and the
//! caller awaits the terminal outcome. Content is buffered into a single frame.

use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{Backend, ContentStream, collect_content, content_from_bytes};
use crate::{
    errors::{AssetError, AssetResult},
    executor::{ConnectOptions, Connector, Outcome, Process, Transaction},
    models::asset::{AssetId, Facet},
    protocol::{Request, Response},
};

/// How often a failed or timed-out call is re-issued as a new transaction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles for each following one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_millis(100),
        }
    }
}

/// "Check the store exists; if not create it; then create the indexes."
pub fn provision_process() -> Process {
    Process::new("provision")
        .step("check store", |_| Some(Request::StoreExists))
        .step("create store", |replies| match replies.last() {
            Some(Response::Exists { value: true }) => None,
            _ => Some(Request::CreateStore),
        })
        .step("create indexes", |_| Some(Request::CreateIndexes))
}

#[derive(Clone)]
pub struct RemoteBackend {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    retry: RetryPolicy,
}

impl RemoteBackend {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectOptions, retry: RetryPolicy) -> Self {
        Self {
            connector,
            options,
            retry,
        }
    }

    /// Make sure the store node has its tables and indexes.
    pub async fn provision(&self) -> AssetResult<()> {
        let tx = Transaction::new(
            provision_process(),
            self.connector.clone(),
            self.options.clone(),
        );
        match tx.execute().outcome().await {
            Outcome::Completed(replies) => {
                info!("store node provisioned ({} commands)", replies.len());
                Ok(())
            }
            Outcome::AuthorizationDenied => Err(AssetError::AuthorizationDenied),
            Outcome::TimedOut => Err(AssetError::Timeout),
            Outcome::Failed(failure) => Err(AssetError::Instantiation(failure.message)),
        }
    }

    /// Run `request` as a single-command transaction, re-issuing it per the
    /// retry policy.
    async fn call(&self, request: Request) -> AssetResult<Response> {
        let attempts = self.retry.attempts.max(1);
        let mut delay = self.retry.backoff;
        let mut attempt = 1;
        loop {
            let tx = Transaction::new(
                Process::single(request.clone()),
                self.connector.clone(),
                self.options.clone(),
            );
            let err = match tx.execute().outcome().await {
                Outcome::Completed(mut replies) => {
                    return replies.pop().ok_or_else(|| {
                        AssetError::Failure(format!("`{}` produced no reply", request.name()))
                    });
                }
                Outcome::AuthorizationDenied => return Err(AssetError::AuthorizationDenied),
                Outcome::TimedOut => AssetError::Timeout,
                Outcome::Failed(failure) => AssetError::Io(match failure.cause {
                    Some(cause) => format!("{}: {}", failure.message, cause),
                    None => failure.message,
                }),
            };
            if attempt >= attempts {
                return Err(err);
            }
            warn!(
                "`{}` attempt {}/{} failed ({}), retrying in {:?}",
                request.name(),
                attempt,
                attempts,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }

    async fn call_unit(&self, request: Request, id: AssetId) -> AssetResult<()> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            Response::NotFound => Err(AssetError::NotFound(id.to_string())),
            other => Err(unexpected(other)),
        }
    }

    async fn call_bytes(&self, request: Request, what: String) -> AssetResult<Bytes> {
        match self.call(request).await? {
            Response::Bytes { data } => Ok(data),
            Response::NotFound => Err(AssetError::NotFound(what)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> AssetError {
    AssetError::Failure(format!("unexpected reply from store node: {:?}", response))
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn exists(&self, id: AssetId) -> AssetResult<bool> {
        match self.call(Request::Exists { id }).await? {
            Response::Exists { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn read_metadata(&self, id: AssetId) -> AssetResult<Bytes> {
        self.call_bytes(Request::ReadMetadata { id }, id.to_string())
            .await
    }

    async fn write_metadata(&self, id: AssetId, body: Bytes) -> AssetResult<()> {
        self.call_unit(Request::WriteMetadata { id, body }, id).await
    }

    async fn read_content(&self, id: AssetId) -> AssetResult<ContentStream> {
        let data = self
            .call_bytes(Request::ReadContent { id }, id.to_string())
            .await?;
        Ok(content_from_bytes(data))
    }

    async fn write_content(&self, id: AssetId, body: ContentStream) -> AssetResult<u64> {
        let body = collect_content(body)
            .await
            .map_err(|err| AssetError::from_io(err, id))?;
        debug!("sending {} content bytes for {}", body.len(), id);
        match self.call(Request::WriteContent { id, body }).await? {
            Response::Written { bytes } => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    async fn archive(&self, id: AssetId, facet: Facet, version: u64) -> AssetResult<()> {
        self.call_unit(Request::Archive { id, facet, version }, id)
            .await
    }

    async fn read_archive(&self, id: AssetId, facet: Facet, version: u64) -> AssetResult<Bytes> {
        self.call_bytes(
            Request::ReadArchive { id, facet, version },
            format!("{} {} v{}", id, facet, version),
        )
        .await
    }

    async fn delete_content(&self, id: AssetId) -> AssetResult<()> {
        self.call_unit(Request::DeleteContent { id }, id).await
    }
}

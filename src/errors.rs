use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::{fmt, io};
use thiserror::Error;

use crate::models::asset::AssetId;

/// Outcome codes shared by every asset operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success,
    NotFound,
    IoError,
    DeserializationError,
    InstantiationError,
    ResourceLocked,
    PermissionsError,
    LengthMismatch,
    HashMismatch,
    AuthorizationDenied,
    Timeout,
    Failure,
}

impl ResultCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ResultCode::Success => StatusCode::OK,
            ResultCode::NotFound => StatusCode::NOT_FOUND,
            ResultCode::ResourceLocked => StatusCode::LOCKED,
            ResultCode::PermissionsError => StatusCode::FORBIDDEN,
            ResultCode::LengthMismatch | ResultCode::HashMismatch => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ResultCode::AuthorizationDenied => StatusCode::BAD_GATEWAY,
            ResultCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ResultCode::IoError
            | ResultCode::DeserializationError
            | ResultCode::InstantiationError
            | ResultCode::Failure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors raised by the asset engine and its backends.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset `{0}` not found")]
    NotFound(String),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("metadata for `{id}` could not be decoded: {reason}")]
    Deserialization { id: AssetId, reason: String },
    #[error("backend could not be created: {0}")]
    Instantiation(String),
    #[error("asset `{id}` is locked by `{owner}`")]
    ResourceLocked { id: AssetId, owner: String },
    #[error("permission denied: {0}")]
    Permissions(String),
    #[error("content length mismatch: declared {expected} bytes, received {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("content hash mismatch: declared {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("store node rejected credentials")]
    AuthorizationDenied,
    #[error("store node did not answer in time")]
    Timeout,
    #[error("unexpected failure: {0}")]
    Failure(String),
}

impl AssetError {
    pub fn code(&self) -> ResultCode {
        match self {
            AssetError::NotFound(_) => ResultCode::NotFound,
            AssetError::Io(_) => ResultCode::IoError,
            AssetError::Deserialization { .. } => ResultCode::DeserializationError,
            AssetError::Instantiation(_) => ResultCode::InstantiationError,
            AssetError::ResourceLocked { .. } => ResultCode::ResourceLocked,
            AssetError::Permissions(_) => ResultCode::PermissionsError,
            AssetError::LengthMismatch { .. } => ResultCode::LengthMismatch,
            AssetError::HashMismatch { .. } => ResultCode::HashMismatch,
            AssetError::AuthorizationDenied => ResultCode::AuthorizationDenied,
            AssetError::Timeout => ResultCode::Timeout,
            AssetError::Failure(_) => ResultCode::Failure,
        }
    }

    /// Map an I/O error raised while touching `what` into the taxonomy.
    pub fn from_io(err: io::Error, what: impl fmt::Display) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AssetError::NotFound(what.to_string()),
            io::ErrorKind::PermissionDenied => {
                AssetError::Permissions(format!("{}: {}", what, err))
            }
            _ => AssetError::Io(format!("{}: {}", what, err)),
        }
    }
}

pub type AssetResult<T> = Result<T, AssetError>;

/// The `{code, payload?, message?}` reply of every asset operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpResult<T> {
    pub code: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> OpResult<T> {
    pub fn success(payload: T) -> Self {
        Self {
            code: ResultCode::Success,
            payload: Some(payload),
            message: None,
        }
    }
}

impl<T> From<AssetResult<T>> for OpResult<T> {
    fn from(result: AssetResult<T>) -> Self {
        match result {
            Ok(payload) => Self::success(payload),
            Err(err) => Self {
                code: err.code(),
                payload: None,
                message: Some(err.to_string()),
            },
        }
    }
}

impl<T: Serialize> IntoResponse for OpResult<T> {
    fn into_response(self) -> Response {
        (self.code.status(), Json(self)).into_response()
    }
}

/// A lightweight wrapper for HTTP-level errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: ResultCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, code: ResultCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ResultCode::Failure, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body: OpResult<()> = OpResult {
            code: self.code,
            payload: None,
            message: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AssetError> for AppError {
    fn from(err: AssetError) -> Self {
        let code = err.code();
        if code == ResultCode::Failure {
            tracing::error!("unexpected asset failure: {}", err);
        }
        AppError::new(code.status(), code, err.to_string())
    }
}

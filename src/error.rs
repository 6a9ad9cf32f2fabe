use std::io;
use std::path::PathBuf;

use actix_web::{HttpResponse, ResponseError, error::BlockingError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::config::BackendMode;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Relay not found: {0}")]
    UnknownRelay(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),
    #[error("Malformed configuration: {0}")]
    ConfigMalformed(String),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),
    #[error("Worker failure: {0}")]
    Blocking(#[from] BlockingError),
}

/// Hardware-level faults raised by a [`LineBackend`](crate::LineBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("line {offset} on {chip} is already requested")]
    LineAlreadyHeld { chip: String, offset: u32 },
    #[error("request line {offset} on {chip}: {reason}")]
    LineRequestFailed {
        chip: String,
        offset: u32,
        reason: String,
    },
    #[error("line {offset} on {chip} not requested")]
    LineNotHeld { chip: String, offset: u32 },
    #[error("line {offset} on {chip}: {reason}")]
    LineIo {
        chip: String,
        offset: u32,
        reason: String,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unexpected value {value:?} in {}", path.display())]
    InvalidReading { path: PathBuf, value: String },
    #[error("pin {pin} exported but {} did not appear", path.display())]
    ExportTimeout { pin: u32, path: PathBuf },
    #[error("relay {relay_id} has no {mode} addressing")]
    NotAddressable { relay_id: String, mode: BackendMode },
}

impl BackendError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackendError::Io {
            path: path.into(),
            source,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::UnknownRelay(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::ConfigNotFound(_)
            | AppError::ConfigMalformed(_)
            | AppError::ConfigInvalid(_)
            | AppError::Backend(_)
            | AppError::Blocking(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

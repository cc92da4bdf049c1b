//! Error taxonomy and the REST response envelope.
//!
//! Every fallible service operation returns [`OmError`]: `Verify` for
//! caller-correctable problems (bad input, not found) and `Sys` for internal
//! failures (storage, filesystem, subprocess). Handlers never panic across
//! the REST boundary; a catch-panic layer converts bugs into a generic 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum OmError {
    /// Caller-correctable: surfaces as a 4xx-shaped envelope.
    #[error("{0}")]
    Verify(String),
    /// Internal/backend failure: surfaces as a 5xx-shaped envelope.
    #[error("{0}")]
    Sys(String),
}

impl OmError {
    pub fn verify(msg: impl Into<String>) -> Self {
        Self::Verify(msg.into())
    }

    pub fn sys(msg: impl Into<String>) -> Self {
        Self::Sys(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Verify(_) => "verify",
            Self::Sys(_) => "sys",
        }
    }
}

impl From<anyhow::Error> for OmError {
    fn from(e: anyhow::Error) -> Self {
        Self::Sys(format!("{e:#}"))
    }
}

pub type OmResult<T> = Result<T, OmError>;

/// The `{code, data, err}` envelope every REST handler returns.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: "ok".to_string(),
        data: Some(data),
        err: None,
    })
}

impl IntoResponse for OmError {
    fn into_response(self) -> Response {
        let status = match &self {
            OmError::Verify(_) => StatusCode::BAD_REQUEST,
            OmError::Sys(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Envelope::<()> {
            code: self.code().to_string(),
            data: None,
            err: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

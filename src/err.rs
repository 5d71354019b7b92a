#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    NotFound { message: String },
    InvalidPayload { message: String },
    ValidationFailed { field: &'static str, message: String },
    SubmissionInFlight { message: String },
    PersistenceFailed { message: String },
    ExportFailed { message: String },
    InternalError { kind: &'static str, message: String },
    Unknown { message: String },
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidPayload { .. } | Error::ValidationFailed { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::SubmissionInFlight { .. } => StatusCode::CONFLICT,
            Error::PersistenceFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::ExportFailed { .. }
            | Error::InternalError { .. }
            | Error::Unknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

/// First failing check of a submission. Only one is ever reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Please fill in {}", humanize(.0))]
    MissingField(&'static str),
    #[error("`{0}` is not an offered course")]
    UnknownCourse(String),
    #[error("Please upload your photo")]
    MissingPhoto,
    #[error("photo too large: {size} bytes, should be less than {} MiB", .limit / (1024 * 1024))]
    PhotoTooLarge { size: usize, limit: usize },
}

impl ValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingField(field) => *field,
            ValidationError::UnknownCourse(_) => "course",
            ValidationError::MissingPhoto | ValidationError::PhotoTooLarge { .. } => "photo",
        }
    }
}

/// Turns `fatherName` into `father name` for messages.
fn humanize(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 4);
    for ch in field.chars() {
        if ch.is_ascii_uppercase() {
            out.push(' ');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Remote save failed. Carries the backend's message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not save registration: {message}")]
pub struct PersistenceError {
    pub message: String,
}

impl PersistenceError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::new(err.to_string())
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::new(err.to_string())
    }
}

impl From<postcard::Error> for PersistenceError {
    fn from(err: postcard::Error) -> Self {
        PersistenceError::new(err.to_string())
    }
}

impl From<anyhow::Error> for PersistenceError {
    fn from(err: anyhow::Error) -> Self {
        PersistenceError::new(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// A submission for this session is already running.
    #[error("registration is already being submitted")]
    InFlight,
    /// The session already produced a card.
    #[error("registration was already submitted")]
    AlreadySubmitted,
}

/// Code image generation failed. Never reaches the user; the card shows a
/// placeholder instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("code encoding failed: {0}")]
pub struct EncodingError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    /// The code image did not resolve within the wait budget.
    #[error("card is not ready for export yet")]
    CodeNotReady,
    #[error("card snapshot is invalid: {0}")]
    Svg(String),
    #[error("rasterization failed: {0}")]
    Raster(String),
    #[error("pdf assembly failed: {0}")]
    Pdf(String),
}

impl From<SubmitError> for Error {
    fn from(err: SubmitError) -> Self {
        let message = err.to_string();
        match err {
            SubmitError::Validation(v) => Error::ValidationFailed {
                field: v.field(),
                message,
            },
            SubmitError::Persistence(_) => Error::PersistenceFailed { message },
            SubmitError::InFlight | SubmitError::AlreadySubmitted => {
                Error::SubmissionInFlight { message }
            }
        }
    }
}

impl From<ExportError> for Error {
    fn from(err: ExportError) -> Self {
        Self::ExportFailed {
            message: err.to_string(),
        }
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Self::PersistenceFailed {
            message: err.message,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::from(err).into()
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        PersistenceError::from(err).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload {
            message: err.to_string(),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for Error {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self::InvalidPayload {
            message: err.to_string(),
        }
    }
}

impl From<crate::ident::InvalidIdentifier> for Error {
    fn from(err: crate::ident::InvalidIdentifier) -> Self {
        Self::NotFound {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}

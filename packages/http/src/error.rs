use std::sync::Arc;

use rxhttp_core::BodyError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid URL: {message}")]
    InvalidUrl { message: String },

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Response code {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Pagination error: {message}")]
    Pagination { message: String },

    #[error("Stream error: {message}")]
    Stream { message: String },
}

/// An [`Error`] shared by every subscriber of a streaming request.
pub type SharedError = Arc<Error>;

impl From<BodyError> for Error {
    fn from(error: BodyError) -> Self {
        match error {
            BodyError::Io(source) => Error::Io(source),
            other => Error::Stream {
                message: other.to_string(),
            },
        }
    }
}

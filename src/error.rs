use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while serving a visitor.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Required configuration is missing or empty.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// No bucketing dataset was supplied to the client.
    #[error("bucketing dataset is required")]
    MissingBucketing,

    /// The bucketing dataset could not be compiled by the decision engine.
    #[error("error parsing bucketing dataset")]
    BucketingParse(#[source] eppo_core::Error),

    /// `Client::start` was called more than once.
    #[error("client is already started")]
    AlreadyStarted,

    /// The client was closed and no longer creates visitors.
    #[error("client is closed")]
    ClientClosed,

    /// The `context` query parameter is not a flat JSON object.
    #[error("invalid visitor context: {0}")]
    InvalidContext(String),

    /// The supplied visitor id is empty, too long or not cookie-safe.
    #[error("invalid visitor id")]
    InvalidVisitorId,

    /// The decision engine failed to evaluate a flag.
    #[error("flag evaluation failed")]
    Evaluation(#[source] eppo_core::EvaluationError),

    /// Visitor cache record could not be encoded or decoded.
    #[error("visitor cache record is malformed")]
    CacheEncoding(#[source] Arc<serde_json::Error>),

    /// The key-value store backing the visitor cache failed.
    #[error("visitor cache store error: {0}")]
    Store(String),

    /// The static asset source failed.
    #[error("asset source error: {0}")]
    Asset(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::CacheEncoding(Arc::new(value))
    }
}

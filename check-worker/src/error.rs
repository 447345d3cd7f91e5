use thiserror::Error;

use check_common::error::JobsError;

/// Enumeration of checker invocation failures. A `Status` error carries the
/// checker's HTTP status code and is what the worker's retry policy
/// inspects; anything else counts as unexpected and is never retried.
#[derive(Error, Debug)]
pub enum CheckerError {
    #[error("checker returned status {status}: {detail}")]
    Status {
        status: http::StatusCode,
        detail: String,
    },
    #[error("checker request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Enumeration of errors related to worker startup and task consumption.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("the async backend is disabled; set LEAN_SERVER_ASYNC_ENABLED=true to run the worker")]
    AsyncDisabled,
    #[error(transparent)]
    Jobs(#[from] JobsError),
    #[error("invalid checker url: {0}")]
    InvalidCheckerUrl(#[from] url::ParseError),
    #[error("failed to construct the checker http client: {0}")]
    Client(reqwest::Error),
}

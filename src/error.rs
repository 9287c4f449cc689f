use std::path::PathBuf;

use thiserror::Error;

/// Failure to read or atomically replace a durable store file.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {path} as JSON: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Range(#[from] RangeError),
}

/// A submitted batch file is not a usable list of credential objects.
#[derive(Error, Debug, PartialEq)]
pub enum BatchInputError {
    #[error("File is too large ({size}). Max: {limit}.")]
    TooLarge { size: String, limit: String },

    #[error("Invalid JSON format near line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Input JSON structure is invalid. It must be an array (a list `[...]`) of objects.")]
    NotAList,

    #[error("All items inside the JSON array must be objects (`{{...}}`). Item {index} is not: {preview}")]
    NotAnObject { index: usize, preview: String },
}

/// The admission gate for a batch run could not be created.
#[derive(Error, Debug, PartialEq)]
pub enum DispatchError {
    #[error("Concurrency limit must be at least 1")]
    ZeroLimit,

    #[error("Concurrency limit {0} exceeds the admission gate maximum")]
    LimitTooLarge(usize),
}

/// Upload-destination failure. Aborts only the upload step.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Configuration invalid: {}", .0.join(", "))]
    InvalidConfig(Vec<String>),

    #[error("The token artifact is empty")]
    EmptyArtifact,

    #[error("Auth error (401). Check token validity/permissions.")]
    Unauthorized,

    #[error("Access error (403): {0}")]
    Forbidden(String),

    #[error("Conflict ({status}): {message}")]
    Conflict { status: u16, message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Timeout
        } else {
            UploadError::Network(err)
        }
    }
}

/// A date derived from user input falls outside the representable range.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("Interval of {0} seconds is out of range")]
    Interval(i64),

    #[error("A subscription of {0} days is out of range")]
    Days(i64),
}

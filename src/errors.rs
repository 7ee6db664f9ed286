//! S3-compatible error types.
//!
//! Every variant maps to exactly one well-known S3 error code, so the
//! protocol layer can translate an [`S3Error`] to a wire status with a pure
//! lookup through [`S3Error::code`] and [`S3Error::status_code`].

use http::StatusCode;
use thiserror::Error;

use crate::storage::backend::StorageError;

/// Result alias used by the multipart engine.
pub type S3Result<T> = Result<T, S3Error>;

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The bucket name does not follow the naming rules.
    #[error("Bucket name invalid: {bucket}")]
    InvalidBucketName { bucket: String },

    /// The object key does not follow the naming rules.
    #[error("Object name invalid: {bucket}#{object}")]
    InvalidObjectName { bucket: String, object: String },

    /// The specified bucket does not exist.
    #[error("Bucket not found: {bucket}")]
    NoSuchBucket { bucket: String },

    /// Unknown, mismatched, completed or aborted upload ID.
    #[error("Invalid upload id {upload_id}")]
    NoSuchUpload { upload_id: String },

    /// The computed part digest differs from the one the caller supplied.
    #[error("Bad digest: Expected {expected} is not valid with what we calculated {calculated}")]
    BadDigest { expected: String, calculated: String },

    /// The body ended before the declared number of bytes was read.
    #[error("Incomplete body: expected {expected} bytes, received {received}")]
    IncompleteBody { expected: u64, received: u64 },

    /// The body carried more bytes than declared.
    #[error("Contains more data than specified size of {limit} bytes.")]
    OversizeBody { limit: u64 },

    /// A part referenced by CompleteMultipartUpload is absent or its ETag differs.
    #[error("{message}")]
    InvalidPart { part_number: u32, message: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The storage backend lacks the capability.
    #[error("Not supported by the storage backend: {operation}")]
    NotImplemented { operation: String },

    /// Catch-all for opaque backend failures.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::InvalidObjectName { .. } => "InvalidObjectName",
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::BadDigest { .. } => "BadDigest",
            S3Error::IncompleteBody { .. } => "IncompleteBody",
            S3Error::OversizeBody { .. } => "EntityTooLarge",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::NotImplemented { .. } => "NotImplemented",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::InvalidBucketName { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidObjectName { .. } => StatusCode::BAD_REQUEST,
            S3Error::NoSuchBucket { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::BadDigest { .. } => StatusCode::BAD_REQUEST,
            S3Error::IncompleteBody { .. } => StatusCode::BAD_REQUEST,
            S3Error::OversizeBody { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidPart { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error came from local validation rather than the backend.
    ///
    /// Validation errors are deterministic given the same inputs.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            S3Error::NotImplemented { .. } | S3Error::InternalError(_)
        )
    }
}

impl From<StorageError> for S3Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotSupported { operation } => S3Error::NotImplemented {
                operation: operation.to_string(),
            },
            StorageError::NoSuchBucket { bucket } => S3Error::NoSuchBucket { bucket },
            other => S3Error::InternalError(anyhow::Error::new(other)),
        }
    }
}

impl From<std::io::Error> for S3Error {
    fn from(err: std::io::Error) -> Self {
        S3Error::InternalError(err.into())
    }
}

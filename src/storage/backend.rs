//! Abstract storage backend trait.
//!
//! Every storage backend must implement [`StorageBackend`]. The multipart
//! engine is written once against this trait: it never touches bytes on
//! disk or over the network itself. Backends stage part data in a scoped
//! temporary ([`StagedPart`]) which the engine commits only after size and
//! digest checks pass. A staged part dropped without a commit is discarded.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::rpc::RpcError;

/// Boxed future returned by every backend operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Errors a backend can report.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend does not implement this capability.
    #[error("operation not supported by this backend: {operation}")]
    NotSupported { operation: &'static str },

    /// The bucket does not exist in the backend.
    #[error("bucket does not exist: {bucket}")]
    NoSuchBucket { bucket: String },

    /// A part referenced during materialization has no committed bytes.
    #[error("part {part_number} of upload {upload_id} has no staged data")]
    MissingPart { upload_id: String, part_number: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Backend-side handle to the scratch space of one multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadArea {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

impl UploadArea {
    pub fn new(bucket: &str, key: &str, upload_id: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        }
    }
}

/// Backend-specific staged bytes awaiting a commit.
///
/// Implementations remove their temporary when dropped uncommitted.
pub trait StagedBytes: Send {
    /// Promote the staged bytes to the part's permanent slot, replacing any
    /// bytes previously committed for the same part number.
    fn commit(self: Box<Self>) -> StorageFuture<'static, ()>;
}

/// A part written to a temporary location but not yet visible.
pub struct StagedPart {
    /// Number of bytes the backend wrote.
    pub bytes_written: u64,
    inner: Box<dyn StagedBytes>,
}

impl StagedPart {
    pub fn new(bytes_written: u64, inner: Box<dyn StagedBytes>) -> Self {
        Self {
            bytes_written,
            inner,
        }
    }

    /// Commit the staged bytes.
    pub async fn commit(self) -> Result<(), StorageError> {
        self.inner.commit().await
    }
}

impl std::fmt::Debug for StagedPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedPart")
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}

/// A committed part, in the order it should appear in the final object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedPartRef {
    pub part_number: u32,
    pub size: u64,
}

/// Metadata describing a materialized object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// Async storage contract used by the multipart engine.
pub trait StorageBackend: Send + Sync + 'static {
    /// Create a bucket. Creating an existing bucket succeeds.
    fn make_bucket(&self, bucket: &str) -> StorageFuture<'_, ()>;

    /// Check whether a bucket exists.
    fn bucket_exists(&self, bucket: &str) -> StorageFuture<'_, bool>;

    /// Prepare scratch space for a new multipart upload.
    fn stage_upload_area(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageFuture<'_, UploadArea>;

    /// Copy `reader` until EOF into a scoped temporary for `part_number`.
    ///
    /// `size` is the caller's declared length. The engine bounds the reader
    /// itself, so backends may use `size` only as a preallocation hint.
    fn write_part<'a>(
        &'a self,
        area: &'a UploadArea,
        part_number: u32,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> StorageFuture<'a, StagedPart>;

    /// Discard every staged and committed part of the upload. Releasing an
    /// area that is already gone succeeds.
    fn release_upload_area<'a>(&'a self, area: &'a UploadArea) -> StorageFuture<'a, ()>;

    /// Concatenate the committed parts, in the given order, into the final
    /// object at `area.bucket`/`area.key`.
    fn materialize_object<'a>(
        &'a self,
        area: &'a UploadArea,
        parts: &'a [StagedPartRef],
        etag: &'a str,
        metadata: &'a HashMap<String, String>,
    ) -> StorageFuture<'a, ObjectInfo>;
}

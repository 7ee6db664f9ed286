//! Multipart upload engine.
//!
//! Per upload the lifecycle is `open -> completed | aborted`. Names are
//! validated before the backend is touched. Part bytes stream through a
//! hashing reader into a backend-staged temporary; only after the size and
//! digest checks pass is the temporary committed, under the upload's lock,
//! together with its part record.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::{PartRecord, UploadRegistry, UploadSummary};
use crate::checksum::{composite_etag, HashingReader};
use crate::errors::{S3Error, S3Result};
use crate::metrics;
use crate::naming::{is_valid_object_prefix, validate_bucket_name, validate_object_name};
use crate::storage::backend::{ObjectInfo, StagedPartRef, StorageBackend, UploadArea};

/// Highest part number S3 accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Upper bound on parts returned by one ListParts page.
pub const MAX_PARTS_LIST: usize = 1000;

/// Upper bound on uploads returned by one ListMultipartUploads page.
pub const MAX_UPLOADS_LIST: usize = 1000;

const INVALID_PART_MESSAGE: &str = "One or more of the specified parts could not be found. \
The part may not have been uploaded, or the specified entity tag may not match the part's entity tag.";

/// A stored part as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: u32,
    /// Lowercase hex MD5 of the part bytes.
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl From<&PartRecord> for PartInfo {
    fn from(record: &PartRecord) -> Self {
        Self {
            part_number: record.part_number,
            etag: record.etag.to_hex(),
            size: record.size,
            last_modified: record.last_modified,
        }
    }
}

/// One page of ListParts.
#[derive(Debug, Clone)]
pub struct ListPartsInfo {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number_marker: u32,
    pub next_part_number_marker: Option<u32>,
    pub max_parts: usize,
    pub is_truncated: bool,
    pub parts: Vec<PartInfo>,
}

/// One page of ListMultipartUploads.
#[derive(Debug, Clone)]
pub struct ListMultipartsInfo {
    pub bucket: String,
    pub prefix: String,
    pub key_marker: String,
    pub upload_id_marker: String,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
    pub max_uploads: usize,
    pub is_truncated: bool,
    pub uploads: Vec<UploadSummary>,
}

/// A `(part number, ETag)` pair named by the caller at completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}

impl CompletePart {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

fn no_such_upload(upload_id: &str) -> S3Error {
    S3Error::NoSuchUpload {
        upload_id: upload_id.to_string(),
    }
}

/// Source-side read errors meaning the transfer closed early.
fn is_truncation(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

fn observe<T>(operation: &'static str, result: &S3Result<T>) {
    match result {
        Ok(_) => metrics::record_operation(operation, "ok"),
        Err(e) => metrics::record_operation(operation, e.code()),
    }
}

/// Drives multipart uploads against a storage backend.
pub struct MultipartEngine {
    registry: UploadRegistry,
    backend: Arc<dyn StorageBackend>,
}

impl MultipartEngine {
    pub fn new(registry: UploadRegistry, backend: Arc<dyn StorageBackend>) -> Self {
        Self { registry, backend }
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn validate_names(bucket: &str, key: &str) -> S3Result<()> {
        validate_bucket_name(bucket)?;
        validate_object_name(bucket, key)
    }

    async fn ensure_bucket(&self, bucket: &str) -> S3Result<()> {
        if self.backend.bucket_exists(bucket).await? {
            Ok(())
        } else {
            Err(S3Error::NoSuchBucket {
                bucket: bucket.to_string(),
            })
        }
    }

    /// Release a staging area after the upload left the registry. The
    /// upload is already terminal, so a failure is only logged.
    async fn release_area(&self, area: &UploadArea) {
        if let Err(e) = self.backend.release_upload_area(area).await {
            warn!(
                bucket = %area.bucket,
                key = %area.key,
                upload_id = %area.upload_id,
                "failed to release upload area: {e}"
            );
        }
    }

    // ── NewMultipartUpload ─────────────────────────────────────────

    /// Start an upload and return its ID.
    pub async fn new_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> S3Result<String> {
        let result = self.new_multipart_upload_inner(bucket, key, metadata).await;
        observe("new_multipart_upload", &result);
        result
    }

    async fn new_multipart_upload_inner(
        &self,
        bucket: &str,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> S3Result<String> {
        Self::validate_names(bucket, key)?;
        self.ensure_bucket(bucket).await?;

        let upload = self.registry.create(bucket, key, metadata);
        if let Err(e) = self
            .backend
            .stage_upload_area(bucket, key, &upload.upload_id)
            .await
        {
            // Never leave an upload open without a staging area.
            let _ = self.registry.remove(bucket, key, &upload.upload_id).await;
            return Err(e.into());
        }

        metrics::set_active_uploads(self.registry.len());
        info!(bucket, key, upload_id = %upload.upload_id, "multipart upload created");
        Ok(upload.upload_id)
    }

    // ── PutObjectPart ──────────────────────────────────────────────

    /// Store one part read from `reader`.
    ///
    /// Exactly `size` bytes must be available: fewer fails with
    /// `IncompleteBody`, more with `OversizeBody`. A non-empty
    /// `expected_md5_hex` must match the computed digest, otherwise the
    /// call fails with `BadDigest`. Nothing is recorded on failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn put_object_part<R>(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        reader: &mut R,
        expected_md5_hex: &str,
    ) -> S3Result<PartInfo>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let result = self
            .put_object_part_inner(bucket, key, upload_id, part_number, size, reader, expected_md5_hex)
            .await;
        observe("put_object_part", &result);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_object_part_inner<R>(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        reader: &mut R,
        expected_md5_hex: &str,
    ) -> S3Result<PartInfo>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        Self::validate_names(bucket, key)?;
        self.ensure_bucket(bucket).await?;
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(S3Error::InvalidArgument {
                message: format!(
                    "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
                ),
            });
        }
        if !self.registry.exists(bucket, key, upload_id).await {
            return Err(no_such_upload(upload_id));
        }

        let area = UploadArea::new(bucket, key, upload_id);
        let mut hashing = HashingReader::new((&mut *reader).take(size));
        let written = self
            .backend
            .write_part(&area, part_number, &mut hashing, size)
            .await;
        let staged = match written {
            Ok(staged) => staged,
            // The caller's stream broke off before delivering `size` bytes.
            Err(_) if hashing.bytes_read() < size
                && hashing.read_error().is_some_and(is_truncation) =>
            {
                return Err(S3Error::IncompleteBody {
                    expected: size,
                    received: hashing.bytes_read(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let (digest, received) = hashing.finish();

        // Every early return below drops `staged`, discarding the temporary.
        if received < size {
            return Err(S3Error::IncompleteBody {
                expected: size,
                received,
            });
        }
        let mut extra = [0u8; 1];
        if reader.read(&mut extra).await? > 0 {
            return Err(S3Error::OversizeBody { limit: size });
        }
        if !expected_md5_hex.is_empty() && !digest.matches_hex(expected_md5_hex) {
            return Err(S3Error::BadDigest {
                expected: expected_md5_hex.to_string(),
                calculated: digest.to_hex(),
            });
        }

        // An abort may have won the race while the bytes were streaming.
        let mut guard = self
            .registry
            .lock(bucket, key, upload_id)
            .await
            .ok_or_else(|| no_such_upload(upload_id))?;
        staged.commit().await?;
        let record = PartRecord {
            part_number,
            size: received,
            etag: digest,
            last_modified: Utc::now(),
        };
        let replaced = guard.put_part(record.clone());
        drop(guard);

        metrics::record_part_bytes(received);
        debug!(
            bucket,
            key,
            upload_id,
            part_number,
            size = received,
            etag = %digest,
            replaced = replaced.is_some(),
            "part committed"
        );
        Ok(PartInfo::from(&record))
    }

    // ── ListObjectParts ────────────────────────────────────────────

    /// List parts numbered above `part_number_marker`. `max_parts` is capped
    /// at [`MAX_PARTS_LIST`], and zero selects that default.
    pub async fn list_object_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: usize,
    ) -> S3Result<ListPartsInfo> {
        let result = async {
            Self::validate_names(bucket, key)?;
            self.ensure_bucket(bucket).await?;

            // Zero means the default page size, as with an absent max-parts.
            let max_parts = match max_parts {
                0 => MAX_PARTS_LIST,
                n => n.min(MAX_PARTS_LIST),
            };
            let page = self
                .registry
                .list_parts(bucket, key, upload_id, part_number_marker, max_parts)
                .await?;
            Ok(ListPartsInfo {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                part_number_marker,
                next_part_number_marker: page.next_part_number_marker,
                max_parts,
                is_truncated: page.is_truncated,
                parts: page.parts.iter().map(PartInfo::from).collect(),
            })
        }
        .await;
        observe("list_object_parts", &result);
        result
    }

    // ── AbortMultipartUpload ───────────────────────────────────────

    /// Abort an open upload and discard its parts. Aborting twice fails
    /// with `NoSuchUpload`.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> S3Result<()> {
        let result = async {
            Self::validate_names(bucket, key)?;
            self.ensure_bucket(bucket).await?;

            let guard = self
                .registry
                .lock(bucket, key, upload_id)
                .await
                .ok_or_else(|| no_such_upload(upload_id))?;
            let upload = self.registry.remove_locked(guard);
            self.release_area(&upload.area()).await;

            metrics::set_active_uploads(self.registry.len());
            info!(bucket, key, upload_id, "multipart upload aborted");
            Ok(())
        }
        .await;
        observe("abort_multipart_upload", &result);
        result
    }

    // ── CompleteMultipartUpload ────────────────────────────────────

    /// Assemble the listed parts, in the listed order, into the final
    /// object. A failed completion leaves the upload open.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> S3Result<ObjectInfo> {
        let result = self
            .complete_multipart_upload_inner(bucket, key, upload_id, parts)
            .await;
        observe("complete_multipart_upload", &result);
        result
    }

    async fn complete_multipart_upload_inner(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> S3Result<ObjectInfo> {
        Self::validate_names(bucket, key)?;
        self.ensure_bucket(bucket).await?;

        let guard = self
            .registry
            .lock(bucket, key, upload_id)
            .await
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() {
            return Err(S3Error::InvalidPart {
                part_number: 0,
                message: "You must specify at least one part".to_string(),
            });
        }

        let upload = guard.upload();
        let mut digests = Vec::with_capacity(parts.len());
        let mut staged = Vec::with_capacity(parts.len());
        let mut listed = HashSet::with_capacity(parts.len());
        for part in parts {
            if !listed.insert(part.part_number) {
                return Err(S3Error::InvalidPart {
                    part_number: part.part_number,
                    message: format!("Part {} is listed more than once", part.part_number),
                });
            }
            let record = upload
                .parts
                .get(&part.part_number)
                .filter(|r| r.etag.matches_hex(&part.etag))
                .ok_or_else(|| S3Error::InvalidPart {
                    part_number: part.part_number,
                    message: INVALID_PART_MESSAGE.to_string(),
                })?;
            digests.push(record.etag);
            staged.push(StagedPartRef {
                part_number: record.part_number,
                size: record.size,
            });
        }

        let etag = composite_etag(&digests);
        let info = self
            .backend
            .materialize_object(&upload.area(), &staged, &etag, &upload.metadata)
            .await?;

        let upload = self.registry.remove_locked(guard);
        self.release_area(&upload.area()).await;

        metrics::set_active_uploads(self.registry.len());
        info!(
            bucket,
            key,
            upload_id,
            parts = parts.len(),
            size = info.size,
            etag = %info.etag,
            "multipart upload completed"
        );
        Ok(info)
    }

    // ── ListMultipartUploads ───────────────────────────────────────

    /// List open uploads in `bucket` under `prefix`. `max_uploads` is capped
    /// at [`MAX_UPLOADS_LIST`], and zero selects that default.
    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        max_uploads: usize,
    ) -> S3Result<ListMultipartsInfo> {
        let result = async {
            validate_bucket_name(bucket)?;
            if !is_valid_object_prefix(prefix) {
                return Err(S3Error::InvalidObjectName {
                    bucket: bucket.to_string(),
                    object: prefix.to_string(),
                });
            }
            self.ensure_bucket(bucket).await?;

            let max_uploads = match max_uploads {
                0 => MAX_UPLOADS_LIST,
                n => n.min(MAX_UPLOADS_LIST),
            };
            let page = self.registry.list_uploads(
                bucket,
                prefix,
                key_marker,
                upload_id_marker,
                max_uploads,
            );
            Ok(ListMultipartsInfo {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                key_marker: key_marker.to_string(),
                upload_id_marker: upload_id_marker.to_string(),
                next_key_marker: page.next_key_marker,
                next_upload_id_marker: page.next_upload_id_marker,
                max_uploads,
                is_truncated: page.is_truncated,
                uploads: page.uploads,
            })
        }
        .await;
        observe("list_multipart_uploads", &result);
        result
    }

    // ── Stale upload expiry ────────────────────────────────────────

    /// Abort every upload initiated more than `max_age` ago. Returns the
    /// number of uploads aborted.
    pub async fn expire_stale_uploads(&self, max_age: chrono::Duration) -> usize {
        // No upload can be older than an unrepresentable cutoff.
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let mut expired = 0;
        for stale in self.registry.initiated_before(cutoff) {
            match self
                .abort_multipart_upload(&stale.bucket, &stale.key, &stale.upload_id)
                .await
            {
                Ok(()) => expired += 1,
                // Completed or aborted since the scan.
                Err(S3Error::NoSuchUpload { .. }) => {}
                Err(e) => warn!(
                    bucket = %stale.bucket,
                    key = %stale.key,
                    upload_id = %stale.upload_id,
                    "failed to expire stale upload: {e}"
                ),
            }
        }
        expired
    }

    /// Run [`expire_stale_uploads`](Self::expire_stale_uploads) every
    /// `interval` until the handle is aborted.
    pub fn spawn_stale_upload_cleanup(
        self: Arc<Self>,
        interval: Duration,
        max_age: chrono::Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = self.expire_stale_uploads(max_age).await;
                if expired > 0 {
                    info!(expired, "expired stale multipart uploads");
                }
            }
        })
    }
}

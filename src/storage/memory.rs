//! In-memory storage backend.
//!
//! Buckets, staging areas and finished objects live in a single
//! `tokio::sync::RwLock`-guarded state shared with outstanding staged parts,
//! so a [`StagedPart`] can commit after the `write_part` call returned.
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;

use super::backend::{
    ObjectInfo, StagedBytes, StagedPart, StagedPartRef, StorageBackend, StorageError,
    StorageFuture, UploadArea,
};

/// A finished object held in memory.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub metadata: HashMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    buckets: HashSet<String>,
    /// upload_id -> part_number -> committed bytes.
    areas: HashMap<String, HashMap<u32, Bytes>>,
    /// "bucket/key" -> object.
    objects: HashMap<String, StoredObject>,
    /// Committed part bytes plus object bytes.
    current_size: u64,
}

impl MemoryState {
    fn check_capacity(&self, max_size_bytes: u64, additional: u64) -> Result<(), StorageError> {
        if max_size_bytes == 0 || self.current_size + additional <= max_size_bytes {
            return Ok(());
        }
        Err(StorageError::Other(anyhow::anyhow!(
            "Memory limit exceeded: current={}, additional={additional}, max={max_size_bytes}",
            self.current_size
        )))
    }
}

/// In-memory storage backend.
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    /// Maximum bytes allowed. 0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryBackend {
    /// Create an empty backend. A `max_size_bytes` of 0 disables the limit.
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            max_size_bytes,
        }
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    /// Fetch a materialized object.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let state = self.state.read().await;
        state.objects.get(&Self::object_key(bucket, key)).cloned()
    }

    /// Whether a staging area exists for `upload_id`.
    pub async fn has_upload_area(&self, upload_id: &str) -> bool {
        self.state.read().await.areas.contains_key(upload_id)
    }

    /// Committed bytes for one part, if any.
    pub async fn committed_part(&self, upload_id: &str, part_number: u32) -> Option<Bytes> {
        let state = self.state.read().await;
        state.areas.get(upload_id)?.get(&part_number).cloned()
    }

    /// Total bytes currently held.
    pub async fn current_size(&self) -> u64 {
        self.state.read().await.current_size
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

struct MemoryStagedPart {
    state: Arc<RwLock<MemoryState>>,
    max_size_bytes: u64,
    upload_id: String,
    part_number: u32,
    data: Bytes,
}

impl StagedBytes for MemoryStagedPart {
    fn commit(self: Box<Self>) -> StorageFuture<'static, ()> {
        let MemoryStagedPart {
            state,
            max_size_bytes,
            upload_id,
            part_number,
            data,
        } = *self;
        Box::pin(async move {
            let mut state = state.write().await;
            let previous = state
                .areas
                .get(&upload_id)
                .ok_or_else(|| {
                    StorageError::Other(anyhow::anyhow!("upload area {upload_id} was released"))
                })?
                .get(&part_number)
                .map_or(0, |b| b.len() as u64);

            let added = data.len() as u64;
            if added > previous {
                state.check_capacity(max_size_bytes, added - previous)?;
            }
            state.current_size = state.current_size - previous + added;
            if let Some(area) = state.areas.get_mut(&upload_id) {
                area.insert(part_number, data);
            }
            Ok(())
        })
    }
}

impl StorageBackend for MemoryBackend {
    fn make_bucket(&self, bucket: &str) -> StorageFuture<'_, ()> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            self.state.write().await.buckets.insert(bucket);
            Ok(())
        })
    }

    fn bucket_exists(&self, bucket: &str) -> StorageFuture<'_, bool> {
        let bucket = bucket.to_string();
        Box::pin(async move { Ok(self.state.read().await.buckets.contains(&bucket)) })
    }

    fn stage_upload_area(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageFuture<'_, UploadArea> {
        let area = UploadArea::new(bucket, key, upload_id);
        Box::pin(async move {
            let mut state = self.state.write().await;
            if !state.buckets.contains(&area.bucket) {
                return Err(StorageError::NoSuchBucket {
                    bucket: area.bucket,
                });
            }
            state.areas.entry(area.upload_id.clone()).or_default();
            Ok(area)
        })
    }

    fn write_part<'a>(
        &'a self,
        area: &'a UploadArea,
        part_number: u32,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> StorageFuture<'a, StagedPart> {
        Box::pin(async move {
            // The declared size is only a hint; cap the preallocation.
            let mut buf = Vec::with_capacity(size.min(8 * 1024 * 1024) as usize);
            reader.read_to_end(&mut buf).await?;

            self.state
                .read()
                .await
                .check_capacity(self.max_size_bytes, buf.len() as u64)?;

            let bytes_written = buf.len() as u64;
            let staged = MemoryStagedPart {
                state: Arc::clone(&self.state),
                max_size_bytes: self.max_size_bytes,
                upload_id: area.upload_id.clone(),
                part_number,
                data: Bytes::from(buf),
            };
            Ok(StagedPart::new(bytes_written, Box::new(staged)))
        })
    }

    fn release_upload_area<'a>(&'a self, area: &'a UploadArea) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if let Some(parts) = state.areas.remove(&area.upload_id) {
                let freed: u64 = parts.values().map(|b| b.len() as u64).sum();
                state.current_size -= freed;
            }
            Ok(())
        })
    }

    fn materialize_object<'a>(
        &'a self,
        area: &'a UploadArea,
        parts: &'a [StagedPartRef],
        etag: &'a str,
        metadata: &'a HashMap<String, String>,
    ) -> StorageFuture<'a, ObjectInfo> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let staged = state.areas.get(&area.upload_id).ok_or_else(|| {
                StorageError::MissingPart {
                    upload_id: area.upload_id.clone(),
                    part_number: parts.first().map_or(0, |p| p.part_number),
                }
            })?;

            let mut data = BytesMut::new();
            for part in parts {
                let bytes = staged
                    .get(&part.part_number)
                    .ok_or_else(|| StorageError::MissingPart {
                        upload_id: area.upload_id.clone(),
                        part_number: part.part_number,
                    })?;
                data.extend_from_slice(bytes);
            }
            let data = data.freeze();

            let object_key = Self::object_key(&area.bucket, &area.key);
            let replaced = state
                .objects
                .get(&object_key)
                .map_or(0, |o| o.data.len() as u64);
            let added = data.len() as u64;
            if added > replaced {
                state.check_capacity(self.max_size_bytes, added - replaced)?;
            }
            state.current_size = state.current_size - replaced + added;

            let last_modified = Utc::now();
            state.objects.insert(
                object_key,
                StoredObject {
                    data: data.clone(),
                    etag: etag.to_string(),
                    metadata: metadata.clone(),
                    last_modified,
                },
            );

            Ok(ObjectInfo {
                bucket: area.bucket.clone(),
                key: area.key.clone(),
                size: added,
                etag: etag.to_string(),
                last_modified,
                metadata: metadata.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn staged(backend: &MemoryBackend, area: &UploadArea, n: u32, data: &[u8]) -> StagedPart {
        let mut reader = data;
        backend
            .write_part(area, n, &mut reader, data.len() as u64)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_make_bucket_is_idempotent() {
        let backend = MemoryBackend::default();
        assert!(!backend.bucket_exists("bucket").await.unwrap());
        backend.make_bucket("bucket").await.unwrap();
        backend.make_bucket("bucket").await.unwrap();
        assert!(backend.bucket_exists("bucket").await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_requires_bucket() {
        let backend = MemoryBackend::default();
        match backend.stage_upload_area("missing", "key", "u1").await {
            Err(StorageError::NoSuchBucket { bucket }) => assert_eq!(bucket, "missing"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_part_is_invisible() {
        let backend = MemoryBackend::default();
        backend.make_bucket("bucket").await.unwrap();
        let area = backend.stage_upload_area("bucket", "key", "u1").await.unwrap();

        let part = staged(&backend, &area, 1, b"abcd").await;
        assert_eq!(part.bytes_written, 4);
        assert!(backend.committed_part("u1", 1).await.is_none());
        drop(part);
        assert!(backend.committed_part("u1", 1).await.is_none());
        assert_eq!(backend.current_size().await, 0);
    }

    #[tokio::test]
    async fn test_commit_replaces_previous_bytes() {
        let backend = MemoryBackend::default();
        backend.make_bucket("bucket").await.unwrap();
        let area = backend.stage_upload_area("bucket", "key", "u1").await.unwrap();

        staged(&backend, &area, 1, b"first").await.commit().await.unwrap();
        staged(&backend, &area, 1, b"2nd").await.commit().await.unwrap();
        assert_eq!(
            backend.committed_part("u1", 1).await.unwrap(),
            Bytes::from_static(b"2nd")
        );
        assert_eq!(backend.current_size().await, 3);
    }

    #[tokio::test]
    async fn test_materialize_concatenates_in_listed_order() {
        let backend = MemoryBackend::default();
        backend.make_bucket("bucket").await.unwrap();
        let area = backend.stage_upload_area("bucket", "key", "u1").await.unwrap();
        staged(&backend, &area, 1, b"abcd").await.commit().await.unwrap();
        staged(&backend, &area, 2, b"efgh").await.commit().await.unwrap();

        let parts = [
            StagedPartRef { part_number: 2, size: 4 },
            StagedPartRef { part_number: 1, size: 4 },
        ];
        let info = backend
            .materialize_object(&area, &parts, "tag-2", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(info.size, 8);

        let obj = backend.get_object("bucket", "key").await.unwrap();
        assert_eq!(obj.data, Bytes::from_static(b"efghabcd"));
        assert_eq!(obj.etag, "tag-2");
    }

    #[tokio::test]
    async fn test_materialize_missing_part() {
        let backend = MemoryBackend::default();
        backend.make_bucket("bucket").await.unwrap();
        let area = backend.stage_upload_area("bucket", "key", "u1").await.unwrap();
        let parts = [StagedPartRef { part_number: 7, size: 1 }];
        match backend
            .materialize_object(&area, &parts, "x", &HashMap::new())
            .await
        {
            Err(StorageError::MissingPart { part_number, .. }) => assert_eq!(part_number, 7),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(backend.get_object("bucket", "key").await.is_none());
    }

    #[tokio::test]
    async fn test_release_frees_bytes_and_is_idempotent() {
        let backend = MemoryBackend::default();
        backend.make_bucket("bucket").await.unwrap();
        let area = backend.stage_upload_area("bucket", "key", "u1").await.unwrap();
        staged(&backend, &area, 1, b"abcd").await.commit().await.unwrap();
        assert_eq!(backend.current_size().await, 4);

        backend.release_upload_area(&area).await.unwrap();
        backend.release_upload_area(&area).await.unwrap();
        assert!(!backend.has_upload_area("u1").await);
        assert_eq!(backend.current_size().await, 0);
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let backend = MemoryBackend::new(6);
        backend.make_bucket("bucket").await.unwrap();
        let area = backend.stage_upload_area("bucket", "key", "u1").await.unwrap();
        staged(&backend, &area, 1, b"abcd").await.commit().await.unwrap();

        let mut reader: &[u8] = b"efgh";
        let result = backend.write_part(&area, 2, &mut reader, 4).await;
        assert!(result.is_err());
    }
}

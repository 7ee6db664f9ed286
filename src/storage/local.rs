//! Local filesystem storage backend.
//!
//! Layout under the configured root:
//!
//! ```text
//! {root}/.tmp/                         scratch files for atomic writes
//! {root}/.multipart/{upload_id}/{N}    committed bytes of part N
//! {root}/{bucket}/{key}                finished objects
//! ```
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.
//! Staged parts hold a [`tempfile::TempPath`] so an uncommitted temporary is
//! unlinked when the guard is dropped, including on task cancellation.

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::backend::{
    ObjectInfo, StagedBytes, StagedPart, StagedPartRef, StorageBackend, StorageError,
    StorageFuture, UploadArea,
};

/// Stores buckets and objects on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored data.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(".tmp"))?;
        std::fs::create_dir_all(root.join(".multipart"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative storage path, rejecting anything that could
    /// escape the root.
    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        for component in Path::new(relative).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(StorageError::Other(anyhow::anyhow!(
                    "Path traversal detected in storage key: {relative}"
                )));
            }
        }
        Ok(self.root.join(relative))
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        self.resolve(bucket)
    }

    fn area_path(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(".multipart").join(self.checked_segment(upload_id)?))
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> Result<PathBuf, StorageError> {
        Ok(self.area_path(upload_id)?.join(part_number.to_string()))
    }

    fn checked_segment<'s>(&self, segment: &'s str) -> Result<&'s str, StorageError> {
        if segment.is_empty() || segment.contains(['/', '\\']) || segment == "." || segment == ".."
        {
            return Err(StorageError::Other(anyhow::anyhow!(
                "invalid path segment: {segment:?}"
            )));
        }
        Ok(segment)
    }

    /// Create a scratch file under `.tmp/`, split into an async file handle
    /// and the path guard that deletes it on drop.
    fn temp_file(&self, prefix: &str) -> Result<(tokio::fs::File, TempPath), StorageError> {
        let named = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(self.root.join(".tmp"))?;
        let (file, path) = named.into_parts();
        Ok((tokio::fs::File::from_std(file), path))
    }
}

/// Part bytes sitting in `.tmp/` until commit renames them into the area.
struct LocalStagedPart {
    temp_path: TempPath,
    final_path: PathBuf,
}

impl StagedBytes for LocalStagedPart {
    fn commit(self: Box<Self>) -> StorageFuture<'static, ()> {
        let LocalStagedPart {
            temp_path,
            final_path,
        } = *self;
        Box::pin(async move {
            // Rename over any previous bytes for this part number. A
            // released area makes the rename fail and the temp is dropped.
            temp_path
                .persist(&final_path)
                .map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
    }
}

impl StorageBackend for LocalBackend {
    fn make_bucket(&self, bucket: &str) -> StorageFuture<'_, ()> {
        let path = self.bucket_path(bucket);
        Box::pin(async move {
            tokio::fs::create_dir_all(path?).await?;
            Ok(())
        })
    }

    fn bucket_exists(&self, bucket: &str) -> StorageFuture<'_, bool> {
        let path = self.bucket_path(bucket);
        Box::pin(async move {
            match tokio::fs::metadata(path?).await {
                Ok(meta) => Ok(meta.is_dir()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn stage_upload_area(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageFuture<'_, UploadArea> {
        let area = UploadArea::new(bucket, key, upload_id);
        Box::pin(async move {
            if !self.bucket_exists(&area.bucket).await? {
                return Err(StorageError::NoSuchBucket {
                    bucket: area.bucket,
                });
            }
            tokio::fs::create_dir_all(self.area_path(&area.upload_id)?).await?;
            Ok(area)
        })
    }

    fn write_part<'a>(
        &'a self,
        area: &'a UploadArea,
        part_number: u32,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        _size: u64,
    ) -> StorageFuture<'a, StagedPart> {
        Box::pin(async move {
            let final_path = self.part_path(&area.upload_id, part_number)?;
            let (mut file, temp_path) = self.temp_file("part-")?;

            let bytes_written = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            Ok(StagedPart::new(
                bytes_written,
                Box::new(LocalStagedPart {
                    temp_path,
                    final_path,
                }),
            ))
        })
    }

    fn release_upload_area<'a>(&'a self, area: &'a UploadArea) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_dir_all(self.area_path(&area.upload_id)?).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
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
            if !self.bucket_exists(&area.bucket).await? {
                return Err(StorageError::NoSuchBucket {
                    bucket: area.bucket.clone(),
                });
            }
            let final_path = self.resolve(&format!("{}/{}", area.bucket, area.key))?;

            let (mut output, temp_path) = self.temp_file("object-")?;
            let mut total_size: u64 = 0;
            for part in parts {
                let part_path = self.part_path(&area.upload_id, part.part_number)?;
                let mut input = match tokio::fs::File::open(&part_path).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(StorageError::MissingPart {
                            upload_id: area.upload_id.clone(),
                            part_number: part.part_number,
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                total_size += tokio::io::copy(&mut input, &mut output).await?;
            }
            output.flush().await?;
            output.sync_all().await?;
            drop(output);

            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            temp_path
                .persist(&final_path)
                .map_err(|e| StorageError::Io(e.error))?;

            tracing::debug!(
                bucket = %area.bucket,
                key = %area.key,
                parts = parts.len(),
                size = total_size,
                "materialized object"
            );

            Ok(ObjectInfo {
                bucket: area.bucket.clone(),
                key: area.key.clone(),
                size: total_size,
                etag: etag.to_string(),
                last_modified: Utc::now(),
                metadata: metadata.clone(),
            })
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let backend = LocalBackend::new(dir.path()).expect("failed to create backend");
        (dir, backend)
    }

    fn tmp_entries(backend: &LocalBackend) -> usize {
        std::fs::read_dir(backend.root().join(".tmp")).unwrap().count()
    }

    async fn stage(backend: &LocalBackend, area: &UploadArea, n: u32, data: &[u8]) -> StagedPart {
        let mut reader = data;
        backend
            .write_part(area, n, &mut reader, data.len() as u64)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_make_bucket_and_exists() {
        let (_dir, backend) = test_backend();
        assert!(!backend.bucket_exists("test-bucket").await.unwrap());
        backend.make_bucket("test-bucket").await.unwrap();
        assert!(backend.bucket_exists("test-bucket").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (_dir, backend) = test_backend();
        assert!(backend.make_bucket("..").await.is_err());
        backend.make_bucket("test-bucket").await.unwrap();
        assert!(backend
            .stage_upload_area("test-bucket", "key", "../escape")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stage_requires_bucket() {
        let (_dir, backend) = test_backend();
        assert!(matches!(
            backend.stage_upload_area("nope", "key", "u1").await,
            Err(StorageError::NoSuchBucket { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_staged_part_leaves_no_temp() {
        let (_dir, backend) = test_backend();
        backend.make_bucket("test-bucket").await.unwrap();
        let area = backend.stage_upload_area("test-bucket", "key", "u1").await.unwrap();

        let staged = stage(&backend, &area, 1, b"abcd").await;
        assert_eq!(staged.bytes_written, 4);
        assert_eq!(tmp_entries(&backend), 1);
        drop(staged);

        assert_eq!(tmp_entries(&backend), 0);
        assert!(!backend.part_path("u1", 1).unwrap().exists());
    }

    #[tokio::test]
    async fn test_commit_overwrites_part() {
        let (_dir, backend) = test_backend();
        backend.make_bucket("test-bucket").await.unwrap();
        let area = backend.stage_upload_area("test-bucket", "key", "u1").await.unwrap();

        stage(&backend, &area, 1, b"old data").await.commit().await.unwrap();
        stage(&backend, &area, 1, b"new").await.commit().await.unwrap();

        let path = backend.part_path("u1", 1).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"new");
        assert_eq!(tmp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_commit_after_release_fails_and_cleans_up() {
        let (_dir, backend) = test_backend();
        backend.make_bucket("test-bucket").await.unwrap();
        let area = backend.stage_upload_area("test-bucket", "key", "u1").await.unwrap();

        let staged = stage(&backend, &area, 1, b"abcd").await;
        backend.release_upload_area(&area).await.unwrap();
        assert!(staged.commit().await.is_err());
        assert_eq!(tmp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_materialize_creates_parent_dirs() {
        let (dir, backend) = test_backend();
        backend.make_bucket("test-bucket").await.unwrap();
        let area = backend
            .stage_upload_area("test-bucket", "a/b/c.txt", "u1")
            .await
            .unwrap();
        stage(&backend, &area, 1, b"hello ").await.commit().await.unwrap();
        stage(&backend, &area, 2, b"world").await.commit().await.unwrap();

        let parts = [
            StagedPartRef { part_number: 1, size: 6 },
            StagedPartRef { part_number: 2, size: 5 },
        ];
        let info = backend
            .materialize_object(&area, &parts, "etag-2", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.etag, "etag-2");

        let data = std::fs::read(dir.path().join("test-bucket/a/b/c.txt")).unwrap();
        assert_eq!(data, b"hello world");
        assert_eq!(tmp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_materialize_missing_part_leaves_no_object() {
        let (dir, backend) = test_backend();
        backend.make_bucket("test-bucket").await.unwrap();
        let area = backend.stage_upload_area("test-bucket", "key", "u1").await.unwrap();
        stage(&backend, &area, 1, b"abcd").await.commit().await.unwrap();

        let parts = [
            StagedPartRef { part_number: 1, size: 4 },
            StagedPartRef { part_number: 3, size: 4 },
        ];
        match backend
            .materialize_object(&area, &parts, "x", &HashMap::new())
            .await
        {
            Err(StorageError::MissingPart { part_number, .. }) => assert_eq!(part_number, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!dir.path().join("test-bucket/key").exists());
        assert_eq!(tmp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_dir, backend) = test_backend();
        backend.make_bucket("test-bucket").await.unwrap();
        let area = backend.stage_upload_area("test-bucket", "key", "u1").await.unwrap();
        stage(&backend, &area, 1, b"abcd").await.commit().await.unwrap();

        backend.release_upload_area(&area).await.unwrap();
        assert!(!backend.area_path("u1").unwrap().exists());
        backend.release_upload_area(&area).await.unwrap();
    }
}

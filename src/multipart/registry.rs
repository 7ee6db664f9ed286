//! Registry of open multipart uploads.
//!
//! The registry is an owned value injected into the engine; nothing about
//! it is process-global. The outer map lock is held only for lookups and
//! inserts. Each upload carries its own async mutex, which the engine holds
//! while it commits staged bytes and records the part, so the bytes and the
//! record of a part number always come from the same write.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::checksum::Md5Digest;
use crate::errors::{S3Error, S3Result};
use crate::storage::backend::UploadArea;

/// One successfully stored part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub part_number: u32,
    pub size: u64,
    pub etag: Md5Digest,
    pub last_modified: DateTime<Utc>,
}

/// Snapshot of an open upload.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub parts: BTreeMap<u32, PartRecord>,
}

impl MultipartUpload {
    /// The backend staging area that belongs to this upload.
    pub fn area(&self) -> UploadArea {
        UploadArea::new(&self.bucket, &self.key, &self.upload_id)
    }

    pub fn total_size(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }
}

/// Identity of an open upload, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// One page of parts.
#[derive(Debug, Clone, Default)]
pub struct PartListing {
    pub parts: Vec<PartRecord>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// One page of uploads.
#[derive(Debug, Clone, Default)]
pub struct UploadListing {
    pub uploads: Vec<UploadSummary>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

struct UploadState {
    upload: MultipartUpload,
    /// Set when the upload leaves the map, so tasks already queued on the
    /// mutex see the terminal state.
    closed: bool,
}

struct UploadEntry {
    summary: UploadSummary,
    state: Arc<Mutex<UploadState>>,
}

/// Exclusive access to one open upload.
pub struct UploadGuard {
    state: OwnedMutexGuard<UploadState>,
}

impl UploadGuard {
    pub fn upload(&self) -> &MultipartUpload {
        &self.state.upload
    }

    /// Record a part, returning the record it replaced.
    pub fn put_part(&mut self, record: PartRecord) -> Option<PartRecord> {
        self.state.upload.parts.insert(record.part_number, record)
    }
}

fn no_such_upload(upload_id: &str) -> S3Error {
    S3Error::NoSuchUpload {
        upload_id: upload_id.to_string(),
    }
}

/// Live multipart uploads keyed by upload ID.
#[derive(Default)]
pub struct UploadRegistry {
    uploads: RwLock<HashMap<String, UploadEntry>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new upload under a fresh random ID.
    pub fn create(
        &self,
        bucket: &str,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> MultipartUpload {
        let mut uploads = self.uploads.write().expect("rwlock poisoned");
        let upload_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !uploads.contains_key(&candidate) {
                break candidate;
            }
        };

        let upload = MultipartUpload {
            upload_id: upload_id.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            initiated: Utc::now(),
            metadata,
            parts: BTreeMap::new(),
        };
        let entry = UploadEntry {
            summary: UploadSummary {
                bucket: upload.bucket.clone(),
                key: upload.key.clone(),
                upload_id: upload_id.clone(),
                initiated: upload.initiated,
            },
            state: Arc::new(Mutex::new(UploadState {
                upload: upload.clone(),
                closed: false,
            })),
        };
        uploads.insert(upload_id, entry);
        upload
    }

    fn slot(&self, upload_id: &str) -> Option<Arc<Mutex<UploadState>>> {
        let uploads = self.uploads.read().expect("rwlock poisoned");
        uploads.get(upload_id).map(|e| Arc::clone(&e.state))
    }

    /// Lock an open upload. Returns `None` when the ID is unknown, the
    /// upload is closed, or it belongs to a different bucket or key.
    pub async fn lock(&self, bucket: &str, key: &str, upload_id: &str) -> Option<UploadGuard> {
        let state = self.slot(upload_id)?.lock_owned().await;
        if state.closed || state.upload.bucket != bucket || state.upload.key != key {
            return None;
        }
        Some(UploadGuard { state })
    }

    /// Whether an open upload with this identity exists.
    pub async fn exists(&self, bucket: &str, key: &str, upload_id: &str) -> bool {
        self.lock(bucket, key, upload_id).await.is_some()
    }

    /// Snapshot an open upload.
    pub async fn get(&self, bucket: &str, key: &str, upload_id: &str) -> Option<MultipartUpload> {
        let guard = self.lock(bucket, key, upload_id).await?;
        Some(guard.upload().clone())
    }

    /// Record a part, returning the record it replaced.
    pub async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        record: PartRecord,
    ) -> S3Result<Option<PartRecord>> {
        let mut guard = self
            .lock(bucket, key, upload_id)
            .await
            .ok_or_else(|| no_such_upload(upload_id))?;
        Ok(guard.put_part(record))
    }

    /// Parts numbered above `start_after`, ascending, at most `limit`.
    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        start_after: u32,
        limit: usize,
    ) -> S3Result<PartListing> {
        let guard = self
            .lock(bucket, key, upload_id)
            .await
            .ok_or_else(|| no_such_upload(upload_id))?;

        let mut parts: Vec<PartRecord> = guard
            .upload()
            .parts
            .range((Bound::Excluded(start_after), Bound::Unbounded))
            .take(limit.saturating_add(1))
            .map(|(_, p)| p.clone())
            .collect();

        let is_truncated = parts.len() > limit;
        if is_truncated {
            parts.truncate(limit);
        }
        let next_part_number_marker = if is_truncated {
            Some(parts.last().map_or(start_after, |p| p.part_number))
        } else {
            None
        };
        Ok(PartListing {
            parts,
            is_truncated,
            next_part_number_marker,
        })
    }

    /// Remove an open upload, returning its final state.
    pub async fn remove(&self, bucket: &str, key: &str, upload_id: &str) -> S3Result<MultipartUpload> {
        let guard = self
            .lock(bucket, key, upload_id)
            .await
            .ok_or_else(|| no_such_upload(upload_id))?;
        Ok(self.remove_locked(guard))
    }

    /// Remove the upload held by `guard` and mark it closed.
    pub fn remove_locked(&self, mut guard: UploadGuard) -> MultipartUpload {
        self.uploads
            .write()
            .expect("rwlock poisoned")
            .remove(&guard.state.upload.upload_id);
        guard.state.closed = true;
        guard.state.upload.clone()
    }

    /// Open uploads in `bucket` whose key starts with `prefix`, ordered by
    /// key then upload ID, resuming after the markers.
    pub fn list_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        max_uploads: usize,
    ) -> UploadListing {
        let mut uploads: Vec<UploadSummary> = {
            let map = self.uploads.read().expect("rwlock poisoned");
            map.values()
                .map(|e| &e.summary)
                .filter(|u| {
                    u.bucket == bucket
                        && u.key.starts_with(prefix)
                        && (key_marker.is_empty()
                            || u.key.as_str() > key_marker
                            || (u.key == key_marker
                                && !upload_id_marker.is_empty()
                                && u.upload_id.as_str() > upload_id_marker))
                })
                .cloned()
                .collect()
        };
        uploads.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.upload_id.cmp(&b.upload_id)));

        let is_truncated = uploads.len() > max_uploads;
        if is_truncated {
            uploads.truncate(max_uploads);
        }
        let (next_key_marker, next_upload_id_marker) = if is_truncated {
            uploads
                .last()
                .map(|u| (Some(u.key.clone()), Some(u.upload_id.clone())))
                .unwrap_or((None, None))
        } else {
            (None, None)
        };

        UploadListing {
            uploads,
            is_truncated,
            next_key_marker,
            next_upload_id_marker,
        }
    }

    /// Open uploads initiated strictly before `cutoff`.
    pub fn initiated_before(&self, cutoff: DateTime<Utc>) -> Vec<UploadSummary> {
        let map = self.uploads.read().expect("rwlock poisoned");
        map.values()
            .filter(|e| e.summary.initiated < cutoff)
            .map(|e| e.summary.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.uploads.read().expect("rwlock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn record(part_number: u32, data: &[u8]) -> PartRecord {
        PartRecord {
            part_number,
            size: data.len() as u64,
            etag: Md5Digest::compute(data),
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = UploadRegistry::new();
        let mut metadata = HashMap::new();
        metadata.insert("content-type".to_string(), "text/plain".to_string());
        let upload = registry.create("bucket", "object", metadata);

        assert!(!upload.upload_id.is_empty());
        assert!(registry.exists("bucket", "object", &upload.upload_id).await);
        let snapshot = registry.get("bucket", "object", &upload.upload_id).await.unwrap();
        assert_eq!(snapshot.metadata["content-type"], "text/plain");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_identity_mismatch_is_unknown() {
        let registry = UploadRegistry::new();
        let upload = registry.create("bucket", "object", HashMap::new());

        assert!(!registry.exists("other", "object", &upload.upload_id).await);
        assert!(!registry.exists("bucket", "other", &upload.upload_id).await);
        assert!(!registry.exists("bucket", "object", "xyz").await);
        assert!(matches!(
            registry
                .put_part("bucket", "other", &upload.upload_id, record(1, b"a"))
                .await,
            Err(S3Error::NoSuchUpload { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_ids_are_unique() {
        let registry = UploadRegistry::new();
        let ids: HashSet<String> = (0..500)
            .map(|_| registry.create("bucket", "object", HashMap::new()).upload_id)
            .collect();
        assert_eq!(ids.len(), 500);
        assert_eq!(registry.len(), 500);
    }

    #[tokio::test]
    async fn test_put_part_last_write_wins() {
        let registry = UploadRegistry::new();
        let id = registry.create("bucket", "object", HashMap::new()).upload_id;

        let first = registry
            .put_part("bucket", "object", &id, record(1, b"abcd"))
            .await
            .unwrap();
        assert!(first.is_none());
        let replaced = registry
            .put_part("bucket", "object", &id, record(1, b"efgh"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced.etag, Md5Digest::compute(b"abcd"));

        let upload = registry.get("bucket", "object", &id).await.unwrap();
        assert_eq!(upload.parts.len(), 1);
        assert_eq!(upload.parts[&1].etag, Md5Digest::compute(b"efgh"));
        assert_eq!(upload.total_size(), 4);
    }

    #[tokio::test]
    async fn test_list_parts_empty() {
        let registry = UploadRegistry::new();
        let id = registry.create("bucket", "object", HashMap::new()).upload_id;
        let page = registry.list_parts("bucket", "object", &id, 0, 1000).await.unwrap();
        assert!(page.parts.is_empty());
        assert!(!page.is_truncated);
        assert_eq!(page.next_part_number_marker, None);
    }

    #[tokio::test]
    async fn test_list_parts_single() {
        let registry = UploadRegistry::new();
        let id = registry.create("bucket", "object", HashMap::new()).upload_id;
        registry
            .put_part("bucket", "object", &id, record(7, b"x"))
            .await
            .unwrap();

        let page = registry.list_parts("bucket", "object", &id, 0, 1).await.unwrap();
        assert_eq!(page.parts.len(), 1);
        assert!(!page.is_truncated);

        let after = registry.list_parts("bucket", "object", &id, 7, 10).await.unwrap();
        assert!(after.parts.is_empty());
    }

    #[tokio::test]
    async fn test_list_parts_paginates_many() {
        let registry = UploadRegistry::new();
        let id = registry.create("bucket", "object", HashMap::new()).upload_id;
        // Insert out of order; listing is always ascending.
        for n in (1..=2500u32).rev() {
            registry
                .put_part("bucket", "object", &id, record(n, &n.to_be_bytes()))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut marker = 0;
        loop {
            let page = registry
                .list_parts("bucket", "object", &id, marker, 1000)
                .await
                .unwrap();
            seen.extend(page.parts.iter().map(|p| p.part_number));
            if !page.is_truncated {
                assert_eq!(page.next_part_number_marker, None);
                break;
            }
            marker = page.next_part_number_marker.unwrap();
        }
        assert_eq!(seen, (1..=2500).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_list_parts_zero_limit() {
        let registry = UploadRegistry::new();
        let id = registry.create("bucket", "object", HashMap::new()).upload_id;
        registry
            .put_part("bucket", "object", &id, record(1, b"x"))
            .await
            .unwrap();

        let page = registry.list_parts("bucket", "object", &id, 0, 0).await.unwrap();
        assert!(page.parts.is_empty());
        assert!(page.is_truncated);
        assert_eq!(page.next_part_number_marker, Some(0));
    }

    #[tokio::test]
    async fn test_remove_is_terminal() {
        let registry = UploadRegistry::new();
        let id = registry.create("bucket", "object", HashMap::new()).upload_id;
        registry
            .put_part("bucket", "object", &id, record(1, b"x"))
            .await
            .unwrap();

        let removed = registry.remove("bucket", "object", &id).await.unwrap();
        assert_eq!(removed.parts.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.get("bucket", "object", &id).await.is_none());
        assert!(matches!(
            registry.remove("bucket", "object", &id).await,
            Err(S3Error::NoSuchUpload { .. })
        ));
        assert!(matches!(
            registry.list_parts("bucket", "object", &id, 0, 10).await,
            Err(S3Error::NoSuchUpload { .. })
        ));
    }

    #[tokio::test]
    async fn test_waiter_observes_removal() {
        let registry = Arc::new(UploadRegistry::new());
        let id = registry.create("bucket", "object", HashMap::new()).upload_id;
        let guard = registry.lock("bucket", "object", &id).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.lock("bucket", "object", &id).await.is_some() })
        };
        tokio::task::yield_now().await;

        registry.remove_locked(guard);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_list_uploads_order_and_markers() {
        let registry = UploadRegistry::new();
        let mut ids_a: Vec<String> = (0..3)
            .map(|_| registry.create("bucket", "photos/a", HashMap::new()).upload_id)
            .collect();
        ids_a.sort();
        let id_b = registry.create("bucket", "photos/b", HashMap::new()).upload_id;
        registry.create("bucket", "docs/c", HashMap::new());
        registry.create("other", "photos/a", HashMap::new());

        let all = registry.list_uploads("bucket", "photos/", "", "", 1000);
        let keys: Vec<&str> = all.uploads.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(keys, ["photos/a", "photos/a", "photos/a", "photos/b"]);
        assert_eq!(all.uploads[0].upload_id, ids_a[0]);
        assert!(!all.is_truncated);

        let page = registry.list_uploads("bucket", "photos/", "", "", 2);
        assert!(page.is_truncated);
        assert_eq!(page.next_key_marker.as_deref(), Some("photos/a"));
        assert_eq!(page.next_upload_id_marker.as_deref(), Some(ids_a[1].as_str()));

        let rest = registry.list_uploads("bucket", "photos/", "photos/a", &ids_a[1], 2);
        let rest_ids: Vec<&str> = rest.uploads.iter().map(|u| u.upload_id.as_str()).collect();
        assert_eq!(rest_ids, [ids_a[2].as_str(), id_b.as_str()]);
        assert!(!rest.is_truncated);

        // A key marker without an upload ID marker skips the whole key.
        let after_a = registry.list_uploads("bucket", "", "photos/a", "", 1000);
        assert_eq!(after_a.uploads.len(), 1);
        assert_eq!(after_a.uploads[0].upload_id, id_b);
    }

    #[tokio::test]
    async fn test_initiated_before() {
        let registry = UploadRegistry::new();
        let upload = registry.create("bucket", "object", HashMap::new());

        assert!(registry.initiated_before(upload.initiated).is_empty());
        let cutoff = upload.initiated + chrono::Duration::seconds(1);
        let stale = registry.initiated_before(cutoff);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].upload_id, upload.upload_id);
    }
}

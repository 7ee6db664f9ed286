//! Gateway backend forwarding bucket operations to a remote server.
//!
//! Bucket calls travel over an [`AuthRpcClient`]. The remote protocol has
//! no multipart staging, so every staging capability reports
//! [`StorageError::NotSupported`] and the engine surfaces `NotImplemented`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::info;

use super::backend::{
    ObjectInfo, StagedPart, StagedPartRef, StorageBackend, StorageError, StorageFuture,
    UploadArea,
};
use crate::rpc::AuthRpcClient;

#[derive(Debug, Serialize)]
struct BucketArgs<'a> {
    bucket: &'a str,
}

#[derive(Debug, Deserialize)]
struct BucketExistsReply {
    exists: bool,
}

/// Storage backend living behind an RPC server.
pub struct GatewayBackend {
    client: Arc<AuthRpcClient>,
}

impl GatewayBackend {
    pub fn new(client: Arc<AuthRpcClient>) -> Self {
        info!(
            "Gateway backend initialized: server={} endpoint={}",
            client.server_addr(),
            client.service_endpoint()
        );
        Self { client }
    }
}

impl StorageBackend for GatewayBackend {
    fn make_bucket(&self, bucket: &str) -> StorageFuture<'_, ()> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let _: serde_json::Value = self
                .client
                .call("Storage.MakeBucket", &BucketArgs { bucket: &bucket })
                .await?;
            Ok(())
        })
    }

    fn bucket_exists(&self, bucket: &str) -> StorageFuture<'_, bool> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let reply: BucketExistsReply = self
                .client
                .call("Storage.BucketExists", &BucketArgs { bucket: &bucket })
                .await?;
            Ok(reply.exists)
        })
    }

    fn stage_upload_area(
        &self,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
    ) -> StorageFuture<'_, UploadArea> {
        Box::pin(async {
            Err(StorageError::NotSupported {
                operation: "stage_upload_area",
            })
        })
    }

    fn write_part<'a>(
        &'a self,
        _area: &'a UploadArea,
        _part_number: u32,
        _reader: &'a mut (dyn AsyncRead + Unpin + Send),
        _size: u64,
    ) -> StorageFuture<'a, StagedPart> {
        Box::pin(async {
            Err(StorageError::NotSupported {
                operation: "write_part",
            })
        })
    }

    fn release_upload_area<'a>(&'a self, _area: &'a UploadArea) -> StorageFuture<'a, ()> {
        Box::pin(async {
            Err(StorageError::NotSupported {
                operation: "release_upload_area",
            })
        })
    }

    fn materialize_object<'a>(
        &'a self,
        _area: &'a UploadArea,
        _parts: &'a [StagedPartRef],
        _etag: &'a str,
        _metadata: &'a HashMap<String, String>,
    ) -> StorageFuture<'a, ObjectInfo> {
        Box::pin(async {
            Err(StorageError::NotSupported {
                operation: "materialize_object",
            })
        })
    }
}

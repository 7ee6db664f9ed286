//! Storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where part and
//! object bytes physically live. Implementations include an in-memory
//! store, local disk, and a gateway to a remote server over RPC.

pub mod backend;
pub mod gateway;
pub mod local;
pub mod memory;

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::rpc::{AuthConfig, AuthRpcClient};
use backend::StorageBackend;

/// Build the backend selected by `storage.backend`.
pub fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "memory" => {
            let max = config.storage.memory.max_size_bytes;
            info!("Memory storage backend initialized (max_size_bytes={max})");
            Arc::new(memory::MemoryBackend::new(max))
        }
        "local" => {
            let storage_root = &config.storage.local.root_dir;
            let local_backend = local::LocalBackend::new(storage_root)?;
            info!("Local storage backend initialized at {}", storage_root);
            Arc::new(local_backend)
        }
        "gateway" => {
            let client = AuthRpcClient::new(AuthConfig::from(&config.rpc));
            Arc::new(gateway::GatewayBackend::new(Arc::new(client)))
        }
        other => anyhow::bail!("unknown storage backend: {other}"),
    };
    Ok(backend)
}

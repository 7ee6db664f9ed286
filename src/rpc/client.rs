//! Token-authenticated RPC client with reconnect and retry.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::retry;
use super::transport::{HttpTransport, RpcTransport};
use super::{LoginArgs, LoginReply, RpcError, RpcRequest, LOGIN_METHOD_NAME};
use crate::config::RpcConfig;

/// Everything needed to build an [`AuthRpcClient`].
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Access key (username) presented at login.
    pub access_key: String,
    /// Secret key (password) presented at login.
    pub secret_key: String,
    /// RPC server network address, `host:port`.
    pub server_addr: String,
    /// Path on the server receiving every call.
    pub service_endpoint: String,
    /// Service name prefixed to the login method.
    pub service_name: String,
    /// Fail immediately on a shut-down connection instead of retrying.
    pub disable_reconnect: bool,
    /// Base unit of the retry backoff.
    pub retry_unit: Duration,
    /// Upper bound of a single retry delay.
    pub retry_cap: Duration,
    /// Maximum number of retries after the first attempt.
    pub retry_attempt_threshold: u32,
}

impl From<&RpcConfig> for AuthConfig {
    fn from(cfg: &RpcConfig) -> Self {
        Self {
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
            server_addr: cfg.server_addr.clone(),
            service_endpoint: cfg.service_endpoint.clone(),
            service_name: cfg.service_name.clone(),
            disable_reconnect: cfg.disable_reconnect,
            retry_unit: Duration::from_millis(cfg.retry_unit_ms),
            retry_cap: Duration::from_millis(cfg.retry_cap_ms),
            retry_attempt_threshold: cfg.retry_attempt_threshold,
        }
    }
}

/// RPC client that logs in before its first call.
///
/// The token is cached behind an async `RwLock`: callers read it on the
/// fast path, and only a missing token takes the write lock, re-checks, and
/// performs the login. Concurrent first calls therefore log in once.
pub struct AuthRpcClient {
    config: AuthConfig,
    transport: Arc<dyn RpcTransport>,
    auth_token: RwLock<Option<String>>,
}

impl AuthRpcClient {
    /// Client speaking JSON over HTTP to `config.server_addr`.
    pub fn new(config: AuthConfig) -> Self {
        let transport = HttpTransport::new(&config.server_addr, &config.service_endpoint);
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: AuthConfig, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            config,
            transport,
            auth_token: RwLock::new(None),
        }
    }

    /// Network address of the server.
    pub fn server_addr(&self) -> &str {
        &self.config.server_addr
    }

    /// RPC endpoint on the server.
    pub fn service_endpoint(&self) -> &str {
        &self.config.service_endpoint
    }

    /// Return the cached token, logging in first if there is none.
    pub async fn login(&self) -> Result<String, RpcError> {
        if let Some(token) = self.auth_token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.auth_token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        let method = format!("{}{}", self.config.service_name, LOGIN_METHOD_NAME);
        let args = LoginArgs {
            username: self.config.access_key.clone(),
            password: self.config.secret_key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_time: chrono::Utc::now(),
        };
        let request = RpcRequest {
            method,
            auth_token: None,
            args: serde_json::to_value(&args)?,
        };
        let reply: LoginReply = serde_json::from_value(self.transport.call(request).await?)?;
        debug!(server = %self.config.server_addr, "rpc login succeeded");

        *slot = Some(reply.auth_token.clone());
        Ok(reply.auth_token)
    }

    async fn call_once(
        &self,
        method: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let token = self.login().await?;
        let request = RpcRequest {
            method: method.to_string(),
            auth_token: Some(token),
            args: args.clone(),
        };
        self.transport.call(request).await
    }

    /// Call `method`, logging in as needed.
    ///
    /// A shut-down connection closes the client and the call is retried
    /// with backoff, up to `retry_attempt_threshold` times, unless
    /// reconnecting is disabled. Every other error is returned as is.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)?;
        let mut attempt: u32 = 0;
        loop {
            match self.call_once(method, &args).await {
                Ok(value) => return Ok(serde_json::from_value(value)?),
                Err(RpcError::Shutdown) => {
                    self.close().await;
                    if self.config.disable_reconnect
                        || attempt >= self.config.retry_attempt_threshold
                    {
                        warn!(
                            server = %self.config.server_addr,
                            method,
                            attempts = attempt + 1,
                            "rpc connection shut down, giving up"
                        );
                        return Err(RpcError::Shutdown);
                    }
                    let delay =
                        retry::backoff(self.config.retry_unit, self.config.retry_cap, attempt);
                    debug!(
                        server = %self.config.server_addr,
                        method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rpc connection shut down, retrying"
                    );
                    crate::metrics::record_rpc_retry(method);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Forget the token and drop the connection.
    pub async fn close(&self) {
        let mut slot = self.auth_token.write().await;
        *slot = None;
        self.transport.close();
    }
}

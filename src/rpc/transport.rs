//! Wire transports for the RPC client.

use reqwest::StatusCode;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use super::{RpcError, RpcRequest, RpcResponse};

/// A connection capable of carrying one request and its reply.
pub trait RpcTransport: Send + Sync + 'static {
    /// Send `request` and return the decoded `result` payload.
    fn call(
        &self,
        request: RpcRequest,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send + '_>>;

    /// Drop the underlying connection. The next call reconnects.
    fn close(&self);
}

/// JSON-over-HTTP transport posting every call to a single endpoint.
pub struct HttpTransport {
    url: String,
    timeout: Option<Duration>,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpTransport {
    /// Create a transport for `http://{server_addr}{service_endpoint}`.
    pub fn new(server_addr: &str, service_endpoint: &str) -> Self {
        Self {
            url: format!("http://{server_addr}{service_endpoint}"),
            timeout: None,
            client: Mutex::new(None),
        }
    }

    /// Bound each HTTP exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Return the live client, building one if the last was closed.
    fn client(&self) -> Result<reqwest::Client, RpcError> {
        let mut guard = self.client.lock().expect("rpc client mutex poisoned");
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to create HTTP client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RpcError {
    if err.is_connect() || err.is_timeout() {
        RpcError::Shutdown
    } else {
        RpcError::Transport(err.to_string())
    }
}

impl RpcTransport for HttpTransport {
    fn call(
        &self,
        request: RpcRequest,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send + '_>> {
        Box::pin(async move {
            let client = self.client()?;
            let resp = client
                .post(&self.url)
                .json(&request)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            match resp.status() {
                StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                    return Err(RpcError::Shutdown)
                }
                status if !status.is_success() => {
                    return Err(RpcError::Remote {
                        method: request.method,
                        message: format!("HTTP {status}"),
                    })
                }
                _ => {}
            }

            let reply: RpcResponse = resp.json().await.map_err(map_reqwest_error)?;
            match reply.error {
                Some(message) => Err(RpcError::Remote {
                    method: request.method,
                    message,
                }),
                None => Ok(reply.result),
            }
        })
    }

    fn close(&self) {
        self.client.lock().expect("rpc client mutex poisoned").take();
    }
}

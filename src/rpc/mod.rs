//! Authenticated RPC collaborator used by remote storage backends.
//!
//! [`AuthRpcClient`] logs in once, caches the issued token and attaches it
//! to every call. A call that finds the connection shut down clears the
//! token, closes the transport and is retried with capped exponential
//! backoff, so the next attempt reconnects and logs in again.

pub mod client;
pub mod retry;
pub mod transport;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::{AuthConfig, AuthRpcClient};
pub use transport::{HttpTransport, RpcTransport};

/// Method suffix of the login call, appended to the service name.
pub const LOGIN_METHOD_NAME: &str = ".Login";

/// Errors surfaced by the RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection is closed or could not be established. Retryable.
    #[error("rpc connection is shut down")]
    Shutdown,

    /// The server handled the call and returned an error.
    #[error("rpc call {method} failed: {message}")]
    Remote { method: String, message: String },

    /// Arguments or reply could not be encoded or decoded.
    #[error("rpc codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Any other transport failure. Not retried.
    #[error("rpc transport error: {0}")]
    Transport(String),
}

/// One call on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub args: serde_json::Value,
}

/// Reply envelope. Exactly one of `result` and `error` is meaningful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// Arguments of the login call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginArgs {
    pub username: String,
    pub password: String,
    pub version: String,
    pub request_time: chrono::DateTime<chrono::Utc>,
}

/// Reply of the login call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginReply {
    pub auth_token: String,
}

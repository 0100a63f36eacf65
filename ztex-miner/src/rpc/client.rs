//! JSON-RPC transport to the job server.

use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};

use super::messages::Request;
use super::{ConnectionEffort, EndpointConfig, RpcError};
use crate::tracing::prelude::*;

/// Raw reply to a JSON-RPC call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcReply {
    pub body: String,
    /// Contents of a non-empty `X-Reject-Reason` header.
    pub reject_reason: Option<String>,
}

/// Something that answers JSON-RPC calls.
///
/// Calls block the calling group thread. Any reply the server sends counts
/// as success at this layer; only connectivity, timeouts and undecodable
/// bodies are errors.
pub trait JobServer: Send + Sync {
    fn call(
        &self,
        endpoint: &EndpointConfig,
        method: &str,
        params: &[String],
    ) -> Result<RpcReply, RpcError>;
}

const USER_AGENT: &str = concat!("ztex-miner/", env!("CARGO_PKG_VERSION"));

/// HTTP POST job server client.
///
/// One instance is shared by all sessions; it owns the request id sequence.
pub struct HttpJobServer {
    client: Client,
    effort: ConnectionEffort,
    seq: AtomicU64,
}

impl HttpJobServer {
    pub fn new(effort: ConnectionEffort) -> Result<Self, RpcError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|e| RpcError::Transport(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            client,
            effort,
            seq: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl JobServer for HttpJobServer {
    fn call(
        &self,
        endpoint: &EndpointConfig,
        method: &str,
        params: &[String],
    ) -> Result<RpcReply, RpcError> {
        let request = Request::new(self.next_id(), method, params);
        let body = serde_json::to_string(&request)
            .map_err(|e| RpcError::Protocol(format!("Cannot encode request: {}", e)))?;

        trace!(url = %endpoint.url, id = request.id, method, "JSON-RPC request");
        let response = self
            .client
            .post(&endpoint.url)
            .basic_auth(&endpoint.user, Some(&endpoint.password))
            .timeout(self.effort.request_timeout())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT_ENCODING, "gzip, deflate")
            .body(body)
            .send()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        // gzip and deflate are decoded by reqwest, which then drops the
        // header; anything still labeled is an encoding we cannot read.
        if let Some(encoding) = response.headers().get(CONTENT_ENCODING) {
            let encoding = encoding.to_str().unwrap_or("?").trim().to_ascii_lowercase();
            if !encoding.is_empty() && encoding != "identity" {
                return Err(RpcError::Transport(format!(
                    "Unknown Content-Encoding: {}",
                    encoding
                )));
            }
        }

        let reject_reason = response
            .headers()
            .get("X-Reject-Reason")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let body = response
            .text()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(RpcReply {
            body,
            reject_reason,
        })
    }
}

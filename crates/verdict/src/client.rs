//! Synchronous RPC client for the Verdict server.

use anyhow::{Context, Result};
use std::time::Duration;
use verdict_protocol::{RpcRequest, RpcResponse, ServiceCall};
use zmq::{Context as ZmqContext, Socket};

/// Default timeout for RPC requests (5 seconds). Long-poll calls pass
/// their own.
const DEFAULT_TIMEOUT_MS: i32 = 5000;

/// REQ-socket client for the server's ROUTER endpoint.
pub struct RpcClient {
    socket: Socket,
    #[allow(dead_code)]
    context: ZmqContext, // Keep context alive
    session: Option<String>,
}

impl RpcClient {
    /// Connect to the RPC surface at the given address.
    pub fn connect(addr: &str, session: Option<String>) -> Result<Self> {
        Self::connect_with_timeout(addr, session, Duration::from_millis(DEFAULT_TIMEOUT_MS as u64))
    }

    /// Connect with a custom receive timeout (long-poll calls).
    pub fn connect_with_timeout(
        addr: &str,
        session: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let context = ZmqContext::new();
        let socket = context
            .socket(zmq::REQ)
            .context("Failed to create REQ socket")?;

        let timeout_ms = timeout.as_millis() as i32;
        socket
            .set_rcvtimeo(timeout_ms)
            .context("Failed to set receive timeout")?;
        socket
            .set_sndtimeo(DEFAULT_TIMEOUT_MS)
            .context("Failed to set send timeout")?;
        socket.set_linger(0).context("Failed to set linger")?;

        socket
            .connect(addr)
            .with_context(|| format!("Failed to connect to {}", addr))?;

        Ok(Self {
            socket,
            context,
            session,
        })
    }

    /// Send one call to a path and parse the response envelope.
    pub fn request(&self, path: &str, call: ServiceCall) -> Result<RpcResponse> {
        let request = RpcRequest {
            path: path.to_string(),
            session: self.session.clone(),
            call,
        };
        let request_bytes = serde_json::to_vec(&request).context("Failed to serialize request")?;

        self.socket
            .send(&request_bytes, 0)
            .context("Failed to send request")?;

        let response_bytes = self
            .socket
            .recv_bytes(0)
            .context("Failed to receive response (timeout or connection error)")?;

        let response: RpcResponse =
            serde_json::from_slice(&response_bytes).context("Failed to parse response")?;

        if let RpcResponse::Error(err) = &response {
            anyhow::bail!("{} [{}]: {}", path, err.kind, err.message);
        }
        Ok(response)
    }
}

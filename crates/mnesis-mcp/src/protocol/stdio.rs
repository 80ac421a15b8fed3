//! stdio Transport
//!
//! Newline-delimited JSON-RPC over stdin/stdout. Logging goes to stderr;
//! stdout carries only protocol frames.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::server::McpServer;

/// Minimal fallback frame when response serialization itself fails, so the
/// client never hangs on a missing reply.
const FALLBACK_ERROR: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#;

pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }

    /// Run the server until stdin closes.
    pub async fn run(self, mut server: McpServer) -> std::io::Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lines = stdin.lines();

        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            debug!("Received: {} bytes", line.len());

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Failed to parse request: {}", e);
                    let response = JsonRpcResponse::error(None, JsonRpcError::parse_error());
                    write_frame(&mut stdout, &response).await?;
                    continue;
                }
            };

            if let Some(response) = server.handle_request(request).await {
                write_frame(&mut stdout, &response).await?;
            }
        }
        Ok(())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_frame(
    stdout: &mut tokio::io::Stdout,
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    match serde_json::to_string(response) {
        Ok(frame) => {
            debug!("Sending: {} bytes", frame.len());
            stdout.write_all(frame.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            stdout.write_all(FALLBACK_ERROR.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
    }
    stdout.flush().await
}

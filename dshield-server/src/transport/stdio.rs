//! Local stdio transport
//!
//! A single producer/consumer pair reading length-prefixed frames from
//! standard input and writing responses to standard output. One request is
//! active at a time; back-pressure is the launcher's responsibility.
//! Logging goes to stderr, never stdout.

use crate::auth::Authenticator;
use crate::mcp::{self, Session};
use crate::rpc::{self, JsonRpcResponse, RpcError, PARSE_ERROR};
use crate::state::ServerState;
use crate::tools::ToolRegistry;
use dshield_core::DshieldResult;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::watch;

/// The stdio transport loop.
pub struct StdioTransport {
    state: Arc<ServerState>,
    registry: Arc<ToolRegistry>,
    authenticator: Arc<Authenticator>,
    max_message_size: usize,
}

impl StdioTransport {
    pub fn new(
        state: Arc<ServerState>,
        registry: Arc<ToolRegistry>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        let max_message_size = state.config.tcp_transport.max_message_size_bytes;
        Self {
            state,
            registry,
            authenticator,
            max_message_size,
        }
    }

    /// Serve requests from stdin until EOF or shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> DshieldResult<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = BufWriter::new(tokio::io::stdout());
        self.serve(stdin, stdout, shutdown).await
    }

    /// Transport loop over arbitrary streams, for tests and for the real
    /// stdin/stdout pair.
    pub async fn serve<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        mut shutdown: watch::Receiver<bool>,
    ) -> DshieldResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut session = Session::local();
        tracing::info!("stdio transport serving");

        loop {
            let frame = tokio::select! {
                frame = rpc::read_frame(&mut reader, self.max_message_size) => frame,
                _ = shutdown.changed() => {
                    tracing::info!("stdio transport shutting down");
                    return Ok(());
                }
            };

            let payload = match frame {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    tracing::info!("stdin closed, stdio transport exiting");
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(error = %err, "framing error on stdin");
                    return Err(err);
                }
            };

            let response = match serde_json::from_slice::<rpc::JsonRpcRequest>(&payload) {
                Ok(request) => {
                    mcp::handle_request(
                        &self.state,
                        &self.registry,
                        &self.authenticator,
                        &mut session,
                        request,
                    )
                    .await
                }
                Err(err) => Some(JsonRpcResponse::error(
                    Value::Null,
                    RpcError::new(PARSE_ERROR, format!("parse error: {}", err)),
                )),
            };

            if let Some(response) = response {
                rpc::write_response(&mut writer, &response).await?;
            }
        }
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

//! JSON-RPC message types and frame codec
//!
//! Messages are JSON-RPC 2.0 shaped. On both transports a message travels
//! as a 4-byte big-endian length prefix followed by exactly that many
//! UTF-8 bytes of JSON; frames above the configured maximum are rejected.

use dshield_core::{DshieldError, DshieldResult, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reserved JSON-RPC error codes used by this server.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const RATE_LIMIT_EXCEEDED: i64 = -32008;

/// An incoming JSON-RPC request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Whether this message expects a response.
    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&DshieldError> for RpcError {
    fn from(err: &DshieldError) -> Self {
        // Internal details stay in the log; the peer gets a sanitized line
        let message = match err {
            DshieldError::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        };
        RpcError::new(err.rpc_code(), message)
    }
}

/// An outgoing JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_error(id: Value, err: &DshieldError) -> Self {
        Self::error(id, RpcError::from(err))
    }
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on clean EOF before a length prefix. Oversize frames
/// are a transport error; the caller closes the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> DshieldResult<Option<Vec<u8>>> {
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(TransportError::Framing {
                reason: e.to_string(),
            }
            .into())
        }
    }

    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > max_size {
        return Err(TransportError::MessageTooLarge {
            size: length,
            limit: max_size,
        }
        .into());
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| {
        DshieldError::from(TransportError::Framing {
            reason: format!("truncated frame: {}", e),
        })
    })?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> DshieldResult<()> {
    let length = payload.len() as u32;
    writer
        .write_all(&length.to_be_bytes())
        .await
        .map_err(framing)?;
    writer.write_all(payload).await.map_err(framing)?;
    writer.flush().await.map_err(framing)?;
    Ok(())
}

/// Serialize and frame a response.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
) -> DshieldResult<()> {
    let payload = serde_json::to_vec(response)
        .map_err(|e| DshieldError::internal(format!("response serialization: {}", e)))?;
    write_frame(writer, &payload).await
}

fn framing(e: std::io::Error) -> DshieldError {
    TransportError::Framing {
        reason: e.to_string(),
    }
    .into()
}

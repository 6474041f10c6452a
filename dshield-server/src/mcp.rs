//! Model-context protocol method layer
//!
//! Dispatches JSON-RPC methods (`initialize`, `tools/*`, `resources/*`,
//! `prompts/*`, and the network-only `authenticate`) against the tool
//! registry. Transport loops feed messages in here one at a time per
//! session, which preserves per-connection response ordering.

use crate::auth::{Authenticator, Permission};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcError, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::state::ServerState;
use crate::tools::ToolRegistry;
use dshield_core::{DshieldError, TransportError};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Protocol version this server speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const SERVER_NAME: &str = "DShield MCP Server";

/// Which transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Local,
    Network,
}

/// Per-session protocol state.
#[derive(Debug)]
pub struct Session {
    pub transport: TransportKind,
    pub authenticated: bool,
    pub initialized: bool,
    pub permissions: HashSet<Permission>,
}

impl Session {
    /// A local stdio session: implicitly trusted, full permissions.
    pub fn local() -> Self {
        Self {
            transport: TransportKind::Local,
            authenticated: true,
            initialized: false,
            permissions: Permission::all(),
        }
    }

    /// A network session; unauthenticated until `authenticate` succeeds,
    /// unless the server runs with no configured keys.
    pub fn network(auth_required: bool) -> Self {
        Self {
            transport: TransportKind::Network,
            authenticated: !auth_required,
            initialized: false,
            permissions: if auth_required {
                HashSet::new()
            } else {
                Permission::all()
            },
        }
    }
}

/// Handle one protocol message. Returns `None` for notifications.
pub async fn handle_request(
    state: &Arc<ServerState>,
    registry: &ToolRegistry,
    authenticator: &Authenticator,
    session: &mut Session,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    if !request.expects_response() {
        handle_notification(session, &request);
        return None;
    }
    let id = request.id.clone().unwrap_or(Value::Null);

    // On the network transport every call before authentication fails,
    // except authenticate itself.
    if session.transport == TransportKind::Network
        && !session.authenticated
        && request.method != "authenticate"
    {
        let err = DshieldError::from(TransportError::AuthenticationRequired {
            method: request.method.clone(),
        });
        return Some(JsonRpcResponse::from_error(id, &err));
    }

    let response = match request.method.as_str() {
        "initialize" => handle_initialize(session, id),
        "authenticate" => handle_authenticate(authenticator, session, id, request.params),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": registry.definitions() })),
        "tools/call" => handle_tool_call(state, registry, session, id, request.params).await,
        "resources/list" => JsonRpcResponse::success(id, json!({ "resources": resource_list() })),
        "resources/read" => handle_resource_read(state, id, request.params),
        "prompts/list" => JsonRpcResponse::success(id, json!({ "prompts": [] })),
        "prompts/get" => JsonRpcResponse::error(
            id,
            RpcError::new(INVALID_PARAMS, "unknown prompt"),
        ),
        other => JsonRpcResponse::error(
            id,
            RpcError::new(METHOD_NOT_FOUND, format!("method not found: {}", other)),
        ),
    };
    Some(response)
}

fn handle_notification(session: &mut Session, request: &JsonRpcRequest) {
    match request.method.as_str() {
        "initialized" | "notifications/initialized" => {
            session.initialized = true;
        }
        other => {
            tracing::debug!(method = other, "ignoring notification");
        }
    }
}

fn handle_initialize(session: &mut Session, id: Value) -> JsonRpcResponse {
    tracing::info!(transport = ?session.transport, "session initializing");
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

fn handle_authenticate(
    authenticator: &Authenticator,
    session: &mut Session,
    id: Value,
    params: Value,
) -> JsonRpcResponse {
    if session.transport != TransportKind::Network {
        return JsonRpcResponse::error(
            id,
            RpcError::new(METHOD_NOT_FOUND, "authenticate is network-only"),
        );
    }

    let Some(api_key) = params.get("api_key").and_then(Value::as_str) else {
        let err = DshieldError::from(dshield_core::ValidationError::RequiredFieldMissing {
            field: "api_key".to_string(),
        });
        return JsonRpcResponse::from_error(id, &err);
    };

    match authenticator.authenticate(api_key) {
        Ok(permissions) => {
            session.authenticated = true;
            session.permissions = permissions;
            tracing::info!("network session authenticated");
            JsonRpcResponse::success(id, json!({ "authenticated": true }))
        }
        Err(err) => {
            tracing::warn!(error = %err, "authentication failed");
            JsonRpcResponse::from_error(id, &err.into())
        }
    }
}

async fn handle_tool_call(
    state: &Arc<ServerState>,
    registry: &ToolRegistry,
    session: &Session,
    id: Value,
    params: Value,
) -> JsonRpcResponse {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        let err = DshieldError::from(dshield_core::ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
        return JsonRpcResponse::from_error(id, &err);
    };
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    match registry
        .dispatch(state.clone(), name, arguments, &session.permissions)
        .await
    {
        Ok(result) => {
            let text = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
            JsonRpcResponse::success(
                id,
                json!({
                    "content": [{ "type": "text", "text": text }],
                    "isError": false
                }),
            )
        }
        Err(err) => {
            tracing::warn!(tool = name, error = %err, "tool call failed");
            JsonRpcResponse::from_error(id, &err)
        }
    }
}

fn resource_list() -> Vec<Value> {
    vec![
        json!({
            "uri": "dshield://cache/statistics",
            "name": "Enrichment cache statistics",
            "description": "Sizes, TTLs, and entry counts of the two-tier cache",
            "mimeType": "application/json"
        }),
        json!({
            "uri": "dshield://intel/sources",
            "name": "Threat intelligence source status",
            "description": "Enabled sources with reliability and budget state",
            "mimeType": "application/json"
        }),
    ]
}

fn handle_resource_read(state: &Arc<ServerState>, id: Value, params: Value) -> JsonRpcResponse {
    let Some(uri) = params.get("uri").and_then(Value::as_str) else {
        let err = DshieldError::from(dshield_core::ValidationError::RequiredFieldMissing {
            field: "uri".to_string(),
        });
        return JsonRpcResponse::from_error(id, &err);
    };

    let body = match uri {
        "dshield://cache/statistics" => match state.intel.cache_statistics() {
            Ok(stats) => serde_json::to_value(stats).unwrap_or(Value::Null),
            Err(err) => return JsonRpcResponse::from_error(id, &err),
        },
        "dshield://intel/sources" => {
            serde_json::to_value(state.intel.source_status()).unwrap_or(Value::Null)
        }
        other => {
            return JsonRpcResponse::error(
                id,
                RpcError::new(INVALID_PARAMS, format!("unknown resource: {}", other)),
            )
        }
    };

    JsonRpcResponse::success(
        id,
        json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": body.to_string()
            }]
        }),
    )
}

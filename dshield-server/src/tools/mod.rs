//! Tool registry and dispatch
//!
//! A table mapping tool names to handlers, each with a JSON Schema for its
//! parameters and a per-tool timeout. Dispatch: look up the tool, validate
//! parameters, run the handler under its deadline, classify failures.

pub mod diag;
pub mod intel;
pub mod siem;

use crate::auth::Permission;
use crate::state::ServerState;
use dshield_core::{DshieldError, DshieldResult, TimeoutSettings, TransportError, ValidationError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// One tool exposed to the assistant.
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub required_permission: Permission,
}

/// The tool table plus compiled parameter validators.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
    validators: HashMap<&'static str, jsonschema::Validator>,
    default_timeout: Duration,
    per_tool_timeouts: HashMap<String, Duration>,
}

impl ToolRegistry {
    /// Build the registry, compiling every parameter schema once.
    pub fn new(timeouts: &TimeoutSettings) -> DshieldResult<Self> {
        let mut tools = Vec::new();
        tools.extend(siem::definitions());
        tools.extend(intel::definitions());
        tools.extend(diag::definitions());

        let mut validators = HashMap::new();
        for tool in &tools {
            let validator = jsonschema::validator_for(&tool.input_schema).map_err(|e| {
                DshieldError::internal(format!("schema for {}: {}", tool.name, e))
            })?;
            validators.insert(tool.name, validator);
        }

        Ok(Self {
            tools,
            validators,
            default_timeout: Duration::from_secs(timeouts.tool_call_seconds),
            per_tool_timeouts: timeouts
                .per_tool_seconds
                .iter()
                .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
                .collect(),
        })
    }

    /// Tool definitions in protocol shape for `tools/list`.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect()
    }

    fn find(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    fn timeout_for(&self, name: &str) -> Duration {
        self.per_tool_timeouts
            .get(name)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Validate and execute one tool call.
    pub async fn dispatch(
        &self,
        state: Arc<ServerState>,
        name: &str,
        arguments: Value,
        permissions: &HashSet<Permission>,
    ) -> DshieldResult<Value> {
        let tool = self.find(name).ok_or_else(|| {
            DshieldError::from(TransportError::MethodNotFound {
                method: name.to_string(),
            })
        })?;

        if !permissions.contains(&tool.required_permission) {
            return Err(TransportError::AuthenticationFailed {
                reason: format!("api key lacks permission for {}", name),
            }
            .into());
        }

        let validator = self.validators.get(name).expect("validator compiled for every tool");
        if let Err(error) = validator.validate(&arguments) {
            return Err(ValidationError::InvalidValue {
                field: error.instance_path().to_string(),
                reason: error.to_string(),
            }
            .into());
        }

        let timeout = self.timeout_for(name);
        let include_stack_trace = state.config.error_handling.logging.include_stack_trace;
        let tool_name = name.to_string();
        let handler = tokio::spawn(async move {
            run_handler(&state, &tool_name, arguments).await
        });
        let abort = handler.abort_handle();

        match tokio::time::timeout(timeout, handler).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                // A panicking handler is a programmer error, surfaced sanitized
                if include_stack_trace {
                    tracing::error!(
                        tool = name,
                        error = %join_error,
                        backtrace = %std::backtrace::Backtrace::force_capture(),
                        "tool handler aborted"
                    );
                } else {
                    tracing::error!(tool = name, error = %join_error, "tool handler aborted");
                }
                Err(DshieldError::internal(format!("tool {} aborted", name)))
            }
            Err(_) => {
                // Cancel the call's task tree; partial results are never emitted
                abort.abort();
                Err(DshieldError::timeout(name, timeout))
            }
        }
    }
}

async fn run_handler(state: &ServerState, name: &str, args: Value) -> DshieldResult<Value> {
    match name {
        "query_dshield_events" => siem::query_events(state, args).await,
        "query_dshield_attacks" => siem::query_attacks(state, args).await,
        "query_dshield_reputation" => siem::query_reputation(state, args).await,
        "query_dshield_top_attackers" => siem::top_attackers(state, args).await,
        "query_dshield_geographic_data" => siem::geographic_data(state, args).await,
        "query_dshield_port_data" => siem::port_data(state, args).await,
        "get_dshield_statistics" => siem::statistics(state, args).await,
        "query_events_by_ip" => siem::events_by_ip(state, args).await,
        "stream_dshield_events" => siem::stream_events(state, args).await,
        "stream_dshield_events_with_session_context" => {
            siem::stream_events_with_sessions(state, args).await
        }
        "enrich_ip_comprehensive" => intel::enrich_ip(state, args).await,
        "enrich_domain_comprehensive" => intel::enrich_domain(state, args).await,
        "correlate_threat_indicators" => intel::correlate_indicators(state, args).await,
        "diagnose_data_availability" => diag::diagnose(state, args).await,
        "health_check" => diag::health_check(state, args).await,
        other => Err(TransportError::MethodNotFound {
            method: other.to_string(),
        }
        .into()),
    }
}

/// Parse tool arguments into a typed parameter struct.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> DshieldResult<T> {
    serde_json::from_value(args).map_err(|e| {
        ValidationError::InvalidValue {
            field: "arguments".to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Serialize a handler result into the tool response payload.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> DshieldResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| DshieldError::internal(format!("result serialization: {}", e)))
}

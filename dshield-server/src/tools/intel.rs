//! Threat intelligence tool handlers

use super::{parse_args, to_json, ToolDef};
use crate::auth::Permission;
use crate::state::ServerState;
use dshield_core::DshieldResult;
use serde::Deserialize;
use serde_json::{json, Value};

pub(crate) async fn enrich_ip(state: &ServerState, args: Value) -> DshieldResult<Value> {
    #[derive(Deserialize)]
    struct EnrichIpArgs {
        ip_address: String,
    }
    let args: EnrichIpArgs = parse_args(args)?;
    let result = state.intel.enrich_ip(&args.ip_address).await?;
    to_json(&result)
}

pub(crate) async fn enrich_domain(state: &ServerState, args: Value) -> DshieldResult<Value> {
    #[derive(Deserialize)]
    struct EnrichDomainArgs {
        domain: String,
    }
    let args: EnrichDomainArgs = parse_args(args)?;
    let result = state.intel.enrich_domain(&args.domain).await?;
    to_json(&result)
}

pub(crate) async fn correlate_indicators(state: &ServerState, args: Value) -> DshieldResult<Value> {
    #[derive(Deserialize)]
    struct CorrelateArgs {
        indicators: Vec<String>,
    }
    let args: CorrelateArgs = parse_args(args)?;
    let correlation = state.intel.correlate_indicators(&args.indicators).await?;
    to_json(&correlation)
}

/// Threat intelligence tool definitions.
pub fn definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "enrich_ip_comprehensive",
            description: "Enrich an IP address across all enabled threat intelligence sources",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ip_address": { "type": "string", "minLength": 2 }
                },
                "required": ["ip_address"],
                "additionalProperties": false
            }),
            required_permission: Permission::Enrich,
        },
        ToolDef {
            name: "enrich_domain_comprehensive",
            description: "Enrich a domain name across sources that support domain lookups",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "domain": { "type": "string", "minLength": 3 }
                },
                "required": ["domain"],
                "additionalProperties": false
            }),
            required_permission: Permission::Enrich,
        },
        ToolDef {
            name: "correlate_threat_indicators",
            description: "Classify and deduplicate a batch of threat indicators",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "indicators": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 1
                    }
                },
                "required": ["indicators"],
                "additionalProperties": false
            }),
            required_permission: Permission::Enrich,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemas_compile_and_require_fields() {
        for tool in definitions() {
            let validator = jsonschema::validator_for(&tool.input_schema)
                .unwrap_or_else(|e| panic!("schema for {} should compile: {}", tool.name, e));
            // Every intel tool has at least one required parameter
            assert!(validator.validate(&json!({})).is_err(), "{}", tool.name);
        }
    }

    #[test]
    fn test_correlate_schema_rejects_empty_batch() {
        let tool = definitions()
            .into_iter()
            .find(|t| t.name == "correlate_threat_indicators")
            .expect("tool exists");
        let validator = jsonschema::validator_for(&tool.input_schema).expect("schema compiles");
        assert!(validator.validate(&json!({ "indicators": [] })).is_err());
        assert!(validator
            .validate(&json!({ "indicators": ["192.0.2.1"] }))
            .is_ok());
    }
}

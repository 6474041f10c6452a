//! Health and diagnostics tool handlers

use super::{parse_args, to_json, ToolDef};
use crate::auth::Permission;
use crate::health;
use crate::state::ServerState;
use dshield_core::DshieldResult;
use dshield_siem::{diagnose_data_availability, DiagnosisOptions};
use serde::Deserialize;
use serde_json::{json, Value};

pub(crate) async fn diagnose(state: &ServerState, args: Value) -> DshieldResult<Value> {
    #[derive(Deserialize)]
    struct DiagnoseArgs {
        #[serde(default = "default_true")]
        check_indices: bool,
        #[serde(default = "default_true")]
        check_mappings: bool,
        #[serde(default = "default_true")]
        check_recent_data: bool,
        #[serde(default = "default_true")]
        sample_query: bool,
    }
    fn default_true() -> bool {
        true
    }

    let args: DiagnoseArgs = parse_args(args)?;
    let options = DiagnosisOptions {
        check_indices: args.check_indices,
        check_mappings: args.check_mappings,
        check_recent_data: args.check_recent_data,
        sample_query: args.sample_query,
    };
    let report = diagnose_data_availability(&state.siem, &options).await;
    to_json(&report)
}

pub(crate) async fn health_check(state: &ServerState, _args: Value) -> DshieldResult<Value> {
    let report = health::run_all_checks(state).await;
    to_json(&report)
}

/// Diagnostics tool definitions.
pub fn definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "diagnose_data_availability",
            description: "Probe index availability, mappings, data recency, and query patterns",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "check_indices": { "type": "boolean" },
                    "check_mappings": { "type": "boolean" },
                    "check_recent_data": { "type": "boolean" },
                    "sample_query": { "type": "boolean" }
                },
                "additionalProperties": false
            }),
            required_permission: Permission::Diagnostics,
        },
        ToolDef {
            name: "health_check",
            description: "Run dependency liveness checks and report aggregate health",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
            required_permission: Permission::Diagnostics,
        },
    ]
}

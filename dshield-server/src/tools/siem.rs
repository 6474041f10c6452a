//! SIEM query tool handlers

use super::{parse_args, to_json, ToolDef};
use crate::auth::Permission;
use crate::state::ServerState;
use dshield_core::{
    DshieldResult, FallbackStrategy, FilterExpr, FilterOperator, OptimizationLevel, SortOrder,
    ValidationError,
};
use dshield_siem::{EventQueryParams, SessionStreamParams, StreamParams};
use serde::Deserialize;
use serde_json::{json, Value};

/// Convert the `filters` argument object into filter expressions.
///
/// Scalar and array values mean equality; an object value maps each of its
/// operator keys (`eq`, `in`, `gte`, ...) to one clause.
pub(crate) fn filters_from_value(value: Option<&Value>) -> DshieldResult<Vec<FilterExpr>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    let map = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        _ => {
            return Err(ValidationError::InvalidValue {
                field: "filters".to_string(),
                reason: "filters must be an object".to_string(),
            }
            .into())
        }
    };

    let mut filters = Vec::new();
    for (field, spec) in map {
        match spec {
            Value::Object(operators) => {
                for (operator, operand) in operators {
                    let operator: FilterOperator = operator.parse()?;
                    filters.push(FilterExpr::new(field.clone(), operator, operand.clone()));
                }
            }
            other => filters.push(FilterExpr::eq(field.clone(), other.clone())),
        }
    }
    Ok(filters)
}

/// Arguments shared by the event-family query tools.
///
/// Unknown fields are rejected by the schema layer, not here; this struct
/// is also flattened into `query_events_by_ip` arguments.
#[derive(Debug, Default, Deserialize)]
struct EventArgs {
    time_range_hours: Option<u32>,
    indices: Option<Vec<String>>,
    filters: Option<Value>,
    fields: Option<Vec<String>>,
    page: Option<u32>,
    page_size: Option<u32>,
    sort_by: Option<String>,
    sort_order: Option<SortOrder>,
    cursor: Option<String>,
    optimization: Option<OptimizationLevel>,
    fallback_strategy: Option<FallbackStrategy>,
    max_result_size_mb: Option<f64>,
    // Only used by query_dshield_reputation
    ip_addresses: Option<Vec<String>>,
}

fn event_params(state: &ServerState, args: &EventArgs) -> DshieldResult<EventQueryParams> {
    let defaults = &state.config.query;
    Ok(EventQueryParams {
        time_range_hours: args.time_range_hours.unwrap_or(24),
        indices: args.indices.clone(),
        filters: filters_from_value(args.filters.as_ref())?,
        fields: args.fields.clone(),
        page: args.page.unwrap_or(1),
        page_size: args.page_size.unwrap_or(defaults.default_page_size),
        sort_by: args.sort_by.clone().unwrap_or_else(|| "@timestamp".to_string()),
        sort_order: args.sort_order.unwrap_or_default(),
        cursor: args.cursor.clone(),
        optimization: args.optimization.unwrap_or(defaults.optimization),
        fallback_strategy: args.fallback_strategy.unwrap_or(defaults.fallback_strategy),
        max_result_size_mb: args.max_result_size_mb.unwrap_or(defaults.max_result_size_mb),
        timeout_seconds: defaults.timeout_seconds,
    })
}

pub(crate) async fn query_events(state: &ServerState, args: Value) -> DshieldResult<Value> {
    let args: EventArgs = parse_args(args)?;
    let page = state.siem.query_events(&event_params(state, &args)?).await?;
    to_json(&page)
}

pub(crate) async fn query_attacks(state: &ServerState, args: Value) -> DshieldResult<Value> {
    let args: EventArgs = parse_args(args)?;
    let page = state.siem.query_attacks(event_params(state, &args)?).await?;
    to_json(&page)
}

pub(crate) async fn query_reputation(state: &ServerState, args: Value) -> DshieldResult<Value> {
    let args: EventArgs = parse_args(args)?;
    let params = event_params(state, &args)?;
    let page = state.siem.query_reputation(args.ip_addresses.clone(), params).await?;
    to_json(&page)
}

#[derive(Debug, Deserialize)]
struct AggregationArgs {
    #[serde(default = "default_hours")]
    time_range_hours: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_hours() -> u32 {
    24
}
fn default_limit() -> u32 {
    10
}

pub(crate) async fn top_attackers(state: &ServerState, args: Value) -> DshieldResult<Value> {
    let args: AggregationArgs = parse_args(args)?;
    let attackers = state.siem.top_attackers(args.time_range_hours, args.limit).await?;
    to_json(&attackers)
}

pub(crate) async fn geographic_data(state: &ServerState, args: Value) -> DshieldResult<Value> {
    let args: AggregationArgs = parse_args(args)?;
    let countries = state.siem.geographic_data(args.time_range_hours, args.limit).await?;
    to_json(&countries)
}

pub(crate) async fn port_data(state: &ServerState, args: Value) -> DshieldResult<Value> {
    let args: AggregationArgs = parse_args(args)?;
    let ports = state.siem.port_data(args.time_range_hours, args.limit).await?;
    to_json(&ports)
}

pub(crate) async fn statistics(state: &ServerState, args: Value) -> DshieldResult<Value> {
    #[derive(Deserialize)]
    struct StatisticsArgs {
        #[serde(default = "default_hours")]
        time_range_hours: u32,
    }
    let args: StatisticsArgs = parse_args(args)?;
    let stats = state.siem.statistics(args.time_range_hours).await?;
    to_json(&stats)
}

pub(crate) async fn events_by_ip(state: &ServerState, args: Value) -> DshieldResult<Value> {
    #[derive(Deserialize)]
    struct EventsByIpArgs {
        ip_addresses: Vec<String>,
        #[serde(flatten)]
        event: EventArgs,
    }
    let args: EventsByIpArgs = parse_args(args)?;
    let params = event_params(state, &args.event)?;
    let page = state.siem.query_events_by_ip(args.ip_addresses, &params).await?;
    to_json(&page)
}

#[derive(Debug, Deserialize)]
struct StreamArgs {
    time_range_hours: Option<u32>,
    indices: Option<Vec<String>>,
    filters: Option<Value>,
    fields: Option<Vec<String>>,
    chunk_size: Option<u32>,
    cursor: Option<String>,
    session_fields: Option<Vec<String>>,
    max_session_gap_minutes: Option<u32>,
    include_session_summary: Option<bool>,
}

fn stream_params(state: &ServerState, args: &StreamArgs) -> DshieldResult<StreamParams> {
    Ok(StreamParams {
        time_range_hours: args.time_range_hours.unwrap_or(24),
        indices: args.indices.clone(),
        filters: filters_from_value(args.filters.as_ref())?,
        fields: args.fields.clone(),
        chunk_size: args.chunk_size.unwrap_or(500),
        cursor: args.cursor.clone(),
        timeout_seconds: state.config.query.timeout_seconds,
    })
}

pub(crate) async fn stream_events(state: &ServerState, args: Value) -> DshieldResult<Value> {
    let args: StreamArgs = parse_args(args)?;
    let chunk = state.siem.stream_events(&stream_params(state, &args)?).await?;
    to_json(&chunk)
}

pub(crate) async fn stream_events_with_sessions(
    state: &ServerState,
    args: Value,
) -> DshieldResult<Value> {
    let args: StreamArgs = parse_args(args)?;
    let defaults = SessionStreamParams::default();
    let params = SessionStreamParams {
        stream: stream_params(state, &args)?,
        session_fields: args.session_fields.clone().unwrap_or(defaults.session_fields),
        max_session_gap_minutes: args
            .max_session_gap_minutes
            .unwrap_or(defaults.max_session_gap_minutes),
        include_session_summary: args
            .include_session_summary
            .unwrap_or(defaults.include_session_summary),
    };
    let chunk = state.siem.stream_events_with_sessions(&params).await?;
    to_json(&chunk)
}

fn event_query_schema(extra_properties: Value) -> Value {
    let mut properties = json!({
        "time_range_hours": { "type": "integer", "minimum": 1, "maximum": 8760 },
        "indices": { "type": "array", "items": { "type": "string" } },
        "filters": { "type": "object" },
        "fields": { "type": "array", "items": { "type": "string" } },
        "page": { "type": "integer", "minimum": 1 },
        "page_size": { "type": "integer", "minimum": 1 },
        "sort_by": { "type": "string" },
        "sort_order": { "type": "string", "enum": ["asc", "desc"] },
        "cursor": { "type": "string" },
        "optimization": { "type": "string", "enum": ["auto", "none"] },
        "fallback_strategy": { "type": "string", "enum": ["aggregate", "sample", "none"] },
        "max_result_size_mb": { "type": "number", "exclusiveMinimum": 0 }
    });
    if let (Some(base), Some(extra)) = (properties.as_object_mut(), extra_properties.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    json!({ "type": "object", "properties": properties, "additionalProperties": false })
}

fn aggregation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "time_range_hours": { "type": "integer", "minimum": 1, "maximum": 8760 },
            "limit": { "type": "integer", "minimum": 1, "maximum": 1000 }
        },
        "additionalProperties": false
    })
}

fn stream_schema(session_properties: bool) -> Value {
    let mut properties = json!({
        "time_range_hours": { "type": "integer", "minimum": 1, "maximum": 8760 },
        "indices": { "type": "array", "items": { "type": "string" } },
        "filters": { "type": "object" },
        "fields": { "type": "array", "items": { "type": "string" } },
        "chunk_size": { "type": "integer", "minimum": 1, "maximum": 1000 },
        "cursor": { "type": "string" }
    });
    if session_properties {
        let extras = json!({
            "session_fields": { "type": "array", "items": { "type": "string" } },
            "max_session_gap_minutes": { "type": "integer", "minimum": 1 },
            "include_session_summary": { "type": "boolean" }
        });
        if let (Some(base), Some(extra)) = (properties.as_object_mut(), extras.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
    }
    json!({ "type": "object", "properties": properties, "additionalProperties": false })
}

/// SIEM tool definitions.
pub fn definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "query_dshield_events",
            description: "Query security events with filters, pagination, and smart size optimization",
            input_schema: event_query_schema(json!({})),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "query_dshield_attacks",
            description: "Query attack events (attack, intrusion, and malware categories)",
            input_schema: event_query_schema(json!({})),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "query_dshield_reputation",
            description: "Query reputation documents, optionally restricted to specific IPs",
            input_schema: event_query_schema(json!({
                "ip_addresses": { "type": "array", "items": { "type": "string" } }
            })),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "query_dshield_top_attackers",
            description: "Top attacking source IPs over a time range",
            input_schema: aggregation_schema(),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "query_dshield_geographic_data",
            description: "Attack counts grouped by source country",
            input_schema: aggregation_schema(),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "query_dshield_port_data",
            description: "Attack counts grouped by destination port",
            input_schema: aggregation_schema(),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "get_dshield_statistics",
            description: "Summary statistics: totals, severity and category breakdowns, unique IPs",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "time_range_hours": { "type": "integer", "minimum": 1, "maximum": 8760 }
                },
                "additionalProperties": false
            }),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "query_events_by_ip",
            description: "Events involving the given IPs as source or destination",
            input_schema: event_query_schema(json!({
                "ip_addresses": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1
                }
            })),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "stream_dshield_events",
            description: "Stream events in cursor-ordered chunks for large datasets",
            input_schema: stream_schema(false),
            required_permission: Permission::Read,
        },
        ToolDef {
            name: "stream_dshield_events_with_session_context",
            description: "Stream events with session-aware chunking that keeps related events together",
            input_schema: stream_schema(true),
            required_permission: Permission::Read,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_scalar_and_array() {
        let value = json!({
            "source_ip": "192.0.2.1",
            "destination_port": [22, 2222]
        });
        let filters = filters_from_value(Some(&value)).expect("conversion should succeed");
        assert_eq!(filters.len(), 2);
        assert!(filters
            .iter()
            .all(|f| f.operator == FilterOperator::Eq));
    }

    #[test]
    fn test_filters_operator_objects() {
        let value = json!({
            "destination.port": { "gte": 1024, "lte": 49151 },
            "event.category": { "in": ["attack", "network"] }
        });
        let mut filters = filters_from_value(Some(&value)).expect("conversion should succeed");
        filters.sort_by(|a, b| (a.field.clone(), a.operator as u8).cmp(&(b.field.clone(), b.operator as u8)));
        assert_eq!(filters.len(), 3);
        assert!(filters.iter().any(|f| f.operator == FilterOperator::Gte));
        assert!(filters.iter().any(|f| f.operator == FilterOperator::Lte));
        assert!(filters.iter().any(|f| f.operator == FilterOperator::In));
    }

    #[test]
    fn test_filters_invalid_operator() {
        let value = json!({ "source.ip": { "between": [1, 2] } });
        let err = filters_from_value(Some(&value)).expect_err("should fail");
        assert_eq!(err.rpc_code(), -32602);
    }

    #[test]
    fn test_filters_non_object_rejected() {
        let value = json!(["not", "an", "object"]);
        assert!(filters_from_value(Some(&value)).is_err());
    }

    #[test]
    fn test_schemas_compile() {
        for tool in definitions() {
            jsonschema::validator_for(&tool.input_schema)
                .unwrap_or_else(|e| panic!("schema for {} should compile: {}", tool.name, e));
        }
    }

    #[test]
    fn test_schema_rejects_page_size_zero() {
        let schema = event_query_schema(json!({}));
        let validator = jsonschema::validator_for(&schema).expect("schema should compile");
        assert!(validator.validate(&json!({ "page_size": 0 })).is_err());
        assert!(validator.validate(&json!({ "page_size": 10 })).is_ok());
    }
}

//! Backend query construction
//!
//! Builds Elasticsearch bool queries from filter expressions. Filter keys
//! are expected to have gone through the alias map already; value shapes
//! follow the backend's conventions (scalar -> term, array -> terms).

use dshield_core::{FilterExpr, FilterOperator, SortOrder, SortSpec, TimeRange, ValidationError};
use serde_json::{json, Value};

/// Clauses produced from a filter set, split by bool section.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BoolClauses {
    pub must: Vec<Value>,
    pub must_not: Vec<Value>,
}

/// Translate filter expressions into bool query clauses.
pub fn filter_clauses(filters: &[FilterExpr]) -> Result<BoolClauses, ValidationError> {
    let mut clauses = BoolClauses::default();

    for filter in filters {
        let field = filter.field.as_str();
        let value = &filter.value;
        match filter.operator {
            FilterOperator::Eq => {
                // Arrays still mean membership even under eq
                if value.is_array() {
                    clauses.must.push(json!({ "terms": { field: value } }));
                } else {
                    clauses.must.push(json!({ "term": { field: value } }));
                }
            }
            FilterOperator::Ne => clauses.must_not.push(json!({ "term": { field: value } })),
            FilterOperator::In => {
                let values = expect_array(filter)?;
                clauses.must.push(json!({ "terms": { field: values } }));
            }
            FilterOperator::NotIn => {
                let values = expect_array(filter)?;
                clauses.must_not.push(json!({ "terms": { field: values } }));
            }
            FilterOperator::Gt => clauses.must.push(json!({ "range": { field: { "gt": value } } })),
            FilterOperator::Lt => clauses.must.push(json!({ "range": { field: { "lt": value } } })),
            FilterOperator::Gte => {
                clauses.must.push(json!({ "range": { field: { "gte": value } } }))
            }
            FilterOperator::Lte => {
                clauses.must.push(json!({ "range": { field: { "lte": value } } }))
            }
            FilterOperator::Exists => clauses.must.push(json!({ "exists": { "field": field } })),
            FilterOperator::Wildcard => {
                clauses.must.push(json!({ "wildcard": { field: value } }))
            }
        }
    }

    Ok(clauses)
}

fn expect_array(filter: &FilterExpr) -> Result<&Value, ValidationError> {
    if filter.value.is_array() {
        Ok(&filter.value)
    } else {
        Err(ValidationError::InvalidValue {
            field: filter.field.clone(),
            reason: "list operator requires an array value".to_string(),
        })
    }
}

/// Build the bool query for the event family.
///
/// `require_endpoints` adds exists filters on `source.ip` and
/// `destination.ip`; the event-stream query family sets it, the
/// reputation/geographic/port family does not.
pub fn build_event_query(
    time_range: &TimeRange,
    filters: &[FilterExpr],
    require_endpoints: bool,
) -> Result<Value, ValidationError> {
    let mut clauses = filter_clauses(filters)?;
    clauses.must.insert(
        0,
        json!({ "range": { "@timestamp": { "gte": time_range.gte, "lte": time_range.lte } } }),
    );

    if require_endpoints {
        clauses.must.push(json!({ "exists": { "field": "source.ip" } }));
        clauses
            .must
            .push(json!({ "exists": { "field": "destination.ip" } }));
    }

    let mut bool_body = json!({ "must": clauses.must });
    if !clauses.must_not.is_empty() {
        bool_body["must_not"] = Value::Array(clauses.must_not);
    }
    Ok(json!({ "bool": bool_body }))
}

/// Build the query matching traffic to or from a set of IPs.
///
/// Source matches are required; destination matches are optional signal
/// (`should` with `minimum_should_match: 0`).
pub fn build_ip_query(ips: &[String], time_range: &TimeRange) -> Value {
    json!({
        "bool": {
            "must": [
                { "range": { "@timestamp": { "gte": time_range.gte, "lte": time_range.lte } } },
                { "terms": { "source.ip": ips } }
            ],
            "should": [
                { "terms": { "destination.ip": ips } }
            ],
            "minimum_should_match": 0
        }
    })
}

/// Assemble a full search body.
#[allow(clippy::too_many_arguments)]
pub fn build_search_body(
    query: &Value,
    size: u32,
    from: Option<u64>,
    search_after: Option<&[Value]>,
    sort: &[SortSpec],
    fields: Option<&[String]>,
    timeout_seconds: u64,
) -> Value {
    let mut body = json!({
        "timeout": format!("{}s", timeout_seconds),
        "query": query,
        "size": size,
    });

    if !sort.is_empty() {
        body["sort"] = Value::Array(
            sort.iter()
                .map(|spec| json!({ spec.field.clone(): { "order": spec.order.as_str() } }))
                .collect(),
        );
    }
    if let Some(from) = from {
        body["from"] = json!(from);
    }
    if let Some(values) = search_after {
        body["search_after"] = Value::Array(values.to_vec());
    }
    if let Some(fields) = fields {
        body["_source"] = json!(fields);
    }

    body
}

/// The default sort used across the event family.
pub fn default_sort() -> Vec<SortSpec> {
    vec![SortSpec::new("@timestamp", SortOrder::Desc)]
}

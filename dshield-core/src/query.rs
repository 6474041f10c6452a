//! Filter expressions and the internal query representation

use crate::{SortOrder, ValidationError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Maximum `size` accepted by the backend per request.
pub const MAX_QUERY_SIZE: u32 = 10_000;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// In list of values
    In,
    /// Not in list of values
    NotIn,
    /// Field exists
    Exists,
    /// Wildcard match
    Wildcard,
}

impl FromStr for FilterOperator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(FilterOperator::Eq),
            "ne" => Ok(FilterOperator::Ne),
            "gt" => Ok(FilterOperator::Gt),
            "lt" => Ok(FilterOperator::Lt),
            "gte" => Ok(FilterOperator::Gte),
            "lte" => Ok(FilterOperator::Lte),
            "in" => Ok(FilterOperator::In),
            "not_in" => Ok(FilterOperator::NotIn),
            "exists" => Ok(FilterOperator::Exists),
            "wildcard" => Ok(FilterOperator::Wildcard),
            other => Err(ValidationError::InvalidOperator {
                operator: other.to_string(),
            }),
        }
    }
}

/// A single filter clause for queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on.
    pub field: String,
    /// Operator to apply.
    pub operator: FilterOperator,
    /// Value to compare against (JSON value for flexibility).
    pub value: serde_json::Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(
        field: impl Into<String>,
        operator: FilterOperator,
        value: serde_json::Value,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create a terms filter.
    pub fn in_values(field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self::new(field, FilterOperator::In, serde_json::Value::Array(values))
    }

    /// Create an exists filter.
    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Exists, serde_json::Value::Bool(true))
    }
}

/// Inclusive time range for the `@timestamp` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Lower bound, e.g. `now-24h`.
    pub gte: String,
    /// Upper bound, e.g. `now`.
    pub lte: String,
}

impl TimeRange {
    /// Range covering the last `hours` hours, relative to the backend clock.
    pub fn last_hours(hours: u32) -> Self {
        Self {
            gte: format!("now-{}h", hours),
            lte: "now".to_string(),
        }
    }
}

/// Sort specification for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Field to sort by.
    pub field: String,
    /// Sort direction.
    pub order: SortOrder,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }

    /// The default sort: `@timestamp` descending.
    pub fn timestamp_desc() -> Self {
        Self::new("@timestamp", SortOrder::Desc)
    }
}

/// Internal representation of a backend query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticsearchQuery {
    /// Indices to query; never empty.
    pub indices: Vec<String>,
    /// Time range filter.
    pub time_range: TimeRange,
    /// Filter clauses.
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
    /// Result size in [1, 10000].
    pub size: u32,
    /// Sort order.
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    /// Optional aggregation body, passed through verbatim.
    pub aggregations: Option<serde_json::Value>,
}

impl ElasticsearchQuery {
    /// Check the structural invariants: indices non-empty, size in range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.indices.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "indices".to_string(),
                reason: "at least one index is required".to_string(),
            });
        }
        if self.size == 0 || self.size > MAX_QUERY_SIZE {
            return Err(ValidationError::OutOfRange {
                field: "size".to_string(),
                value: self.size.to_string(),
                min: "1".to_string(),
                max: MAX_QUERY_SIZE.to_string(),
            });
        }
        Ok(())
    }
}

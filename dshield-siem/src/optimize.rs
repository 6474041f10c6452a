//! Query optimization pipeline
//!
//! Keeps estimated result payloads under the caller's byte budget by
//! degrading precision before completeness: field reduction, then page-size
//! reduction, then a fallback strategy. The decision logic is pure; only
//! the size estimate touches the backend (a `_count` round trip).

use crate::client::SearchBackend;
use dshield_core::{DshieldResult, OptimizationStep};
use serde_json::Value;

/// Fields kept first during field reduction, in priority order.
pub const PRIORITY_FIELDS: [&str; 8] = [
    "@timestamp",
    "source.ip",
    "destination.ip",
    "source.port",
    "destination.port",
    "event.category",
    "event.type",
    "severity",
];

/// Non-priority fields retained after reduction.
const EXTRA_FIELD_LIMIT: usize = 5;

/// Bytes assumed per projected field per document.
const BYTES_PER_FIELD: u64 = 1024;

/// Bytes assumed per document without a projection.
const BYTES_PER_DOC: u64 = 5 * 1024;

/// Page size below which page reduction stops.
const MIN_PAGE_SIZE: u32 = 10;

/// Result of running the optimization cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationOutcome {
    /// Field projection after any reduction.
    pub fields: Option<Vec<String>>,
    /// Page size after any reduction.
    pub page_size: u32,
    /// Steps that were applied, in order.
    pub steps: Vec<OptimizationStep>,
    /// Final size estimate in megabytes.
    pub estimated_mb: f64,
    /// Whether the estimate fits the budget; when false the caller applies
    /// its fallback strategy.
    pub within_budget: bool,
}

/// Estimate the result payload for one page, in megabytes.
///
/// `min(count, page_size)` documents are fetched, at 1 KiB per projected
/// field or 5 KiB per full document. Zero matching documents estimate to
/// zero and trigger no degradation.
pub fn estimate_size_mb(total_docs: u64, page_size: u32, fields: Option<&[String]>) -> f64 {
    let bytes_per_doc = match fields {
        Some(fields) if !fields.is_empty() => fields.len() as u64 * BYTES_PER_FIELD,
        _ => BYTES_PER_DOC,
    };
    let docs = total_docs.min(u64::from(page_size));
    (docs * bytes_per_doc) as f64 / (1024.0 * 1024.0)
}

/// Reduce a projection: priority fields first, then up to five of the
/// caller's remaining fields in the order they were supplied.
pub fn reduce_fields(fields: &[String]) -> Vec<String> {
    let mut reduced: Vec<String> = Vec::new();

    for priority in PRIORITY_FIELDS {
        if fields.iter().any(|f| f == priority) {
            reduced.push(priority.to_string());
        }
    }

    let extras: Vec<String> = fields
        .iter()
        .filter(|f| !reduced.contains(f))
        .take(EXTRA_FIELD_LIMIT)
        .cloned()
        .collect();
    reduced.extend(extras);

    reduced
}

/// Run the degradation cascade against a count of matching documents.
///
/// `count_body` must carry the same filter set as the eventual search so
/// the estimate reflects what would actually be fetched.
pub async fn plan(
    backend: &dyn SearchBackend,
    indices: &[String],
    count_body: &Value,
    fields: Option<Vec<String>>,
    page_size: u32,
    budget_mb: f64,
) -> DshieldResult<OptimizationOutcome> {
    let total_docs = match backend.count(indices, count_body).await {
        Ok(count) => count,
        Err(err) => {
            // Estimation failure must not kill the query; assume a full page
            tracing::warn!(error = %err, "size estimation failed, assuming full page");
            u64::from(page_size)
        }
    };

    let mut fields = fields;
    let mut page_size = page_size;
    let mut steps = Vec::new();

    let mut estimated_mb = estimate_size_mb(total_docs, page_size, fields.as_deref());
    tracing::debug!(estimated_mb, budget_mb, total_docs, "query size estimated");

    if estimated_mb > budget_mb {
        if let Some(projection) = &fields {
            if projection.len() > 3 {
                let reduced = reduce_fields(projection);
                tracing::info!(from = projection.len(), to = reduced.len(), "field reduction applied");
                fields = Some(reduced);
                steps.push(OptimizationStep::FieldReduction);
                estimated_mb = estimate_size_mb(total_docs, page_size, fields.as_deref());
            }
        }
    }

    if estimated_mb > budget_mb && page_size > MIN_PAGE_SIZE {
        page_size = (page_size / 2).max(MIN_PAGE_SIZE);
        tracing::info!(page_size, "page size reduction applied");
        steps.push(OptimizationStep::PageReduction);
        estimated_mb = estimate_size_mb(total_docs, page_size, fields.as_deref());
    }

    Ok(OptimizationOutcome {
        fields,
        page_size,
        steps,
        estimated_mb,
        within_budget: estimated_mb <= budget_mb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dshield_core::DshieldError;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountBackend {
        count: u64,
        calls: AtomicU64,
    }

    impl CountBackend {
        fn new(count: u64) -> Self {
            Self {
                count,
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchBackend for CountBackend {
        async fn search(&self, _: &[String], _: &Value) -> DshieldResult<Value> {
            Err(DshieldError::internal("not scripted"))
        }
        async fn count(&self, _: &[String], _: &Value) -> DshieldResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.count)
        }
        async fn list_indices(&self) -> DshieldResult<Vec<String>> {
            Ok(vec![])
        }
        async fn get_mapping(&self, _: &str) -> DshieldResult<Value> {
            Ok(Value::Null)
        }
        async fn cluster_health(&self) -> DshieldResult<Value> {
            Ok(Value::Null)
        }
        async fn cluster_stats(&self) -> DshieldResult<Value> {
            Ok(Value::Null)
        }
        async fn index_document(&self, _: &str, _: &str, _: &Value) -> DshieldResult<()> {
            Ok(())
        }
    }

    fn indices() -> Vec<String> {
        vec!["dshield-*".to_string()]
    }

    #[test]
    fn test_estimate_with_projection() {
        // 100 docs at 4 fields = 400 KiB
        let fields: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let mb = estimate_size_mb(1000, 100, Some(&fields));
        assert!((mb - 100.0 * 4.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_zero_docs_is_zero() {
        assert_eq!(estimate_size_mb(0, 100, None), 0.0);
    }

    #[test]
    fn test_estimate_caps_at_page_size() {
        assert_eq!(
            estimate_size_mb(1_000_000, 100, None),
            estimate_size_mb(100, 100, None)
        );
    }

    #[test]
    fn test_reduce_fields_priority_then_extras() {
        let fields: Vec<String> = [
            "payload",
            "source.ip",
            "severity",
            "http.request.body",
            "@timestamp",
            "url.original",
            "user_agent.original",
            "extra1",
            "extra2",
            "extra3",
            "extra4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let reduced = reduce_fields(&fields);
        // Priority fields first, in the fixed order
        assert_eq!(&reduced[..3], &["@timestamp", "source.ip", "severity"]);
        // Then up to five extras in the caller's order
        assert_eq!(
            &reduced[3..],
            &["payload", "http.request.body", "url.original", "user_agent.original", "extra1"]
        );
    }

    #[tokio::test]
    async fn test_plan_no_degradation_when_within_budget() {
        let backend = CountBackend::new(10);
        let outcome = plan(
            &backend,
            &indices(),
            &serde_json::json!({"query": {"match_all": {}}}),
            None,
            100,
            10.0,
        )
        .await
        .expect("plan should succeed");

        assert!(outcome.within_budget);
        assert!(outcome.steps.is_empty());
        assert_eq!(outcome.page_size, 100);
    }

    #[tokio::test]
    async fn test_plan_zero_docs_no_degradation() {
        let backend = CountBackend::new(0);
        let outcome = plan(
            &backend,
            &indices(),
            &serde_json::json!({}),
            Some(vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()]),
            500,
            0.001,
        )
        .await
        .expect("plan should succeed");

        assert_eq!(outcome.estimated_mb, 0.0);
        assert!(outcome.within_budget);
        assert!(outcome.steps.is_empty());
    }

    #[tokio::test]
    async fn test_plan_cascade_to_fallback() {
        // 1M docs, no projection, tiny budget: both steps fire and the
        // outcome still needs a fallback.
        let backend = CountBackend::new(1_000_000);
        let fields: Vec<String> = (0..10).map(|i| format!("field{}", i)).collect();
        let outcome = plan(
            &backend,
            &indices(),
            &serde_json::json!({}),
            Some(fields),
            1000,
            0.01,
        )
        .await
        .expect("plan should succeed");

        assert_eq!(
            outcome.steps,
            vec![OptimizationStep::FieldReduction, OptimizationStep::PageReduction]
        );
        assert_eq!(outcome.page_size, 500);
        assert!(!outcome.within_budget);
    }

    #[tokio::test]
    async fn test_plan_page_floor() {
        let backend = CountBackend::new(1_000_000);
        let outcome = plan(&backend, &indices(), &serde_json::json!({}), None, 15, 0.0001)
            .await
            .expect("plan should succeed");
        assert_eq!(outcome.page_size, 10);
    }
}

//! Data-availability diagnostics
//!
//! Probes the cluster from four angles (index discovery, mappings, data
//! recency, query patterns) and produces a structured report with
//! recommendations. Used when queries unexpectedly return nothing.

use crate::engine::{EventQueryParams, SiemEngine};
use chrono::{DateTime, Utc};
use dshield_core::{DiagnosticSeverity, OptimizationLevel};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Which probes to run.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosisOptions {
    pub check_indices: bool,
    pub check_mappings: bool,
    pub check_recent_data: bool,
    pub sample_query: bool,
}

impl Default for DiagnosisOptions {
    fn default() -> Self {
        Self {
            check_indices: true,
            check_mappings: true,
            check_recent_data: true,
            sample_query: true,
        }
    }
}

/// Structured diagnostic report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisReport {
    pub timestamp: DateTime<Utc>,
    /// `healthy`, `issues_detected: ...`, or `diagnosis_failed`.
    pub overall_status: String,
    pub severity: DiagnosticSeverity,
    pub summary: BTreeMap<String, String>,
    pub details: Value,
    pub recommendations: Vec<String>,
}

/// Time windows probed by the recency check, in hours.
const PROBE_WINDOWS: [u32; 4] = [1, 6, 24, 168];

/// Index patterns tried by the sample-query check; `None` is auto-detection.
fn probe_patterns() -> Vec<Option<Vec<String>>> {
    vec![
        Some(vec!["dshield-*".to_string()]),
        Some(vec!["cowrie-*".to_string()]),
        Some(vec!["zeek-*".to_string()]),
        Some(vec!["*".to_string()]),
        None,
    ]
}

/// Run the selected probes and assemble the report.
pub async fn diagnose_data_availability(
    engine: &SiemEngine,
    options: &DiagnosisOptions,
) -> DiagnosisReport {
    let mut summary: BTreeMap<String, String> = BTreeMap::new();
    let mut details = serde_json::Map::new();
    let mut recommendations: Vec<String> = Vec::new();
    let mut issues: Vec<&str> = Vec::new();

    let configured_patterns = engine.index_patterns().join(", ");
    let mut available_indices: Vec<String> = Vec::new();

    // 1. Index discovery against the configured patterns
    if options.check_indices {
        match engine.backend().list_indices().await {
            Ok(all_indices) => {
                available_indices = all_indices
                    .iter()
                    .filter(|name| {
                        engine
                            .index_patterns()
                            .iter()
                            .any(|pattern| crate::engine::matches_pattern(name, pattern))
                    })
                    .cloned()
                    .collect();

                details.insert(
                    "available_indices".to_string(),
                    json!({
                        "count": available_indices.len(),
                        "indices": available_indices.clone(),
                        "configured_patterns": engine.index_patterns(),
                    }),
                );

                if available_indices.is_empty() {
                    summary.insert("indices_issue".into(), "No matching indices found".into());
                    issues.push("indices");
                    recommendations.push(format!(
                        "Review the configured index_patterns ({}) in the elasticsearch section",
                        configured_patterns
                    ));
                    recommendations.push(format!(
                        "Verify that indices matching the index_patterns ({}) exist and are readable",
                        configured_patterns
                    ));
                } else {
                    summary.insert(
                        "indices_status".into(),
                        format!("Found {} indices", available_indices.len()),
                    );
                }
            }
            Err(err) => {
                summary.insert("indices_issue".into(), format!("Failed to list indices: {}", err));
                issues.push("indices");
                details.insert("indices_error".to_string(), json!(err.to_string()));
            }
        }
    }

    // 2. Mapping of the first available index
    if options.check_mappings {
        if let Some(sample_index) = available_indices.first() {
            match engine.backend().get_mapping(sample_index).await {
                Ok(mapping) => {
                    let properties = mapping
                        .pointer(&format!("/{}/mappings/properties", sample_index))
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    let field_names: Vec<&String> = properties.keys().collect();
                    let timestamp_fields: Vec<&&String> = field_names
                        .iter()
                        .filter(|name| {
                            let lower = name.to_lowercase();
                            lower.contains("time") || lower.contains("date")
                        })
                        .collect();

                    details.insert(
                        "sample_mapping".to_string(),
                        json!({
                            "index": sample_index,
                            "field_count": field_names.len(),
                            "key_fields": field_names.iter().take(10).collect::<Vec<_>>(),
                            "timestamp_fields": timestamp_fields,
                        }),
                    );
                }
                Err(err) => {
                    summary.insert("mapping_issue".into(), format!("Failed to check mappings: {}", err));
                    issues.push("mappings");
                    details.insert("mapping_error".to_string(), json!(err.to_string()));
                }
            }
        }
    }

    // 3. Data recency across widening time windows
    if options.check_recent_data {
        let mut availability = serde_json::Map::new();
        let mut recent_total: Option<u64> = None;

        for hours in PROBE_WINDOWS {
            let params = EventQueryParams {
                time_range_hours: hours,
                page_size: 1,
                optimization: OptimizationLevel::None,
                ..Default::default()
            };
            match engine.query_events(&params).await {
                Ok(page) => {
                    if hours == 24 {
                        recent_total = Some(page.total_count);
                    }
                    availability.insert(
                        format!("{}h", hours),
                        json!({
                            "events_found": page.events.len(),
                            "total_count": page.total_count,
                        }),
                    );
                }
                Err(err) => {
                    availability.insert(format!("{}h", hours), json!({ "error": err.to_string() }));
                }
            }
        }

        details.insert("data_availability".to_string(), Value::Object(availability));

        if recent_total == Some(0) {
            summary.insert(
                "data_issue".into(),
                "No recent data found in the last 24 hours".into(),
            );
            issues.push("data");
            recommendations.push("Check whether events are being ingested into the cluster".into());
            recommendations.push("Verify timestamp field mappings and ingest pipeline output".into());
        }
    }

    // 4. Try alternative index patterns
    if options.sample_query {
        let mut pattern_tests = serde_json::Map::new();
        let mut working: Vec<String> = Vec::new();

        for pattern in probe_patterns() {
            let label = pattern
                .as_ref()
                .map(|p| p.join(","))
                .unwrap_or_else(|| "auto".to_string());
            let params = EventQueryParams {
                time_range_hours: 24,
                indices: pattern,
                page_size: 1,
                optimization: OptimizationLevel::None,
                ..Default::default()
            };
            match engine.query_events(&params).await {
                Ok(page) => {
                    if page.total_count > 0 {
                        working.push(label.clone());
                    }
                    pattern_tests.insert(
                        label,
                        json!({
                            "success": true,
                            "total_count": page.total_count,
                        }),
                    );
                }
                Err(err) => {
                    pattern_tests.insert(
                        label,
                        json!({ "success": false, "error": err.to_string() }),
                    );
                }
            }
        }

        details.insert("pattern_tests".to_string(), Value::Object(pattern_tests));

        if working.is_empty() {
            summary.insert("pattern_issue".into(), "No working query patterns found".into());
            issues.push("queries");
            recommendations.push("Check cluster connectivity and index read permissions".into());
        } else {
            summary.insert(
                "working_patterns".into(),
                format!("Found {} working patterns", working.len()),
            );
            recommendations.push(format!("Use working patterns: {}", working.join(", ")));
        }
    }

    let (overall_status, severity) = if issues.is_empty() {
        ("healthy".to_string(), DiagnosticSeverity::Low)
    } else {
        let severity = if issues.len() > 2 {
            DiagnosticSeverity::High
        } else {
            DiagnosticSeverity::Medium
        };
        (format!("issues_detected: {}", issues.join(", ")), severity)
    };

    if recommendations.is_empty() {
        recommendations.push("Data availability appears healthy".into());
        recommendations.push("If issues persist, check the server logs for errors".into());
    }

    DiagnosisReport {
        timestamp: Utc::now(),
        overall_status,
        severity,
        summary,
        details: Value::Object(details),
        recommendations,
    }
}

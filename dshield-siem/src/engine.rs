//! High-level SIEM query engine
//!
//! Composes the query builder, optimizer, and parser into the query
//! families exposed as tools: events, attacks, reputation, top attackers,
//! geographic and port distributions, and summary statistics.

use crate::client::SearchBackend;
use crate::cursor::{decode_cursor, encode_cursor};
use crate::optimize;
use crate::parse::parse_event;
use crate::query::{build_event_query, build_ip_query, build_search_body, default_sort};
use chrono::Utc;
use dshield_core::{
    map_filters, DshieldError, DshieldResult, EventCategory, FallbackStrategy, FilterExpr,
    OptimizationLevel, PaginationInfo, QueryConfig, SecurityEvent, SortOrder, SortSpec, TimeRange,
    ValidationError,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Parameters for an event-family query.
#[derive(Debug, Clone)]
pub struct EventQueryParams {
    pub time_range_hours: u32,
    pub indices: Option<Vec<String>>,
    pub filters: Vec<FilterExpr>,
    pub fields: Option<Vec<String>>,
    pub page: u32,
    pub page_size: u32,
    pub sort_by: String,
    pub sort_order: SortOrder,
    pub cursor: Option<String>,
    pub optimization: OptimizationLevel,
    pub fallback_strategy: FallbackStrategy,
    pub max_result_size_mb: f64,
    pub timeout_seconds: u64,
}

impl Default for EventQueryParams {
    fn default() -> Self {
        Self {
            time_range_hours: 24,
            indices: None,
            filters: Vec::new(),
            fields: None,
            page: 1,
            page_size: 100,
            sort_by: "@timestamp".to_string(),
            sort_order: SortOrder::Desc,
            cursor: None,
            optimization: OptimizationLevel::Auto,
            fallback_strategy: FallbackStrategy::Aggregate,
            max_result_size_mb: 10.0,
            timeout_seconds: 30,
        }
    }
}

/// One page of parsed events plus pagination metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventPage {
    pub events: Vec<SecurityEvent>,
    pub total_count: u64,
    pub pagination: PaginationInfo,
}

/// One bucket from the top-attackers aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopAttacker {
    pub ip_address: String,
    pub attack_count: u64,
}

/// One bucket from the geographic aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeographicSummary {
    pub country: String,
    pub attack_count: u64,
}

/// One bucket from the port aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSummary {
    pub port: u16,
    pub attack_count: u64,
}

/// Summary statistics over a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiemStatistics {
    pub time_range_hours: u32,
    pub total_events: u64,
    pub events_by_severity: Vec<(String, u64)>,
    pub events_by_category: Vec<(String, u64)>,
    pub unique_source_ips: u64,
    pub unique_destination_ips: u64,
    pub top_source_ips: Vec<TopAttacker>,
    pub indices_queried: Vec<String>,
}

/// The SIEM query engine.
pub struct SiemEngine {
    backend: Arc<dyn SearchBackend>,
    config: QueryConfig,
    index_patterns: Vec<String>,
    fallback_indices: Vec<String>,
}

impl SiemEngine {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        config: QueryConfig,
        index_patterns: Vec<String>,
        fallback_indices: Vec<String>,
    ) -> Self {
        Self {
            backend,
            config,
            index_patterns,
            fallback_indices,
        }
    }

    /// The backend this engine queries.
    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    /// Configured index patterns, for diagnostics.
    pub fn index_patterns(&self) -> &[String] {
        &self.index_patterns
    }

    /// Discover indices matching the configured patterns.
    ///
    /// Falls back to the configured fallback patterns when discovery finds
    /// nothing (or fails).
    pub async fn resolve_indices(&self, requested: Option<Vec<String>>) -> Vec<String> {
        if let Some(indices) = requested {
            if !indices.is_empty() {
                return indices;
            }
        }

        match self.backend.list_indices().await {
            Ok(names) => {
                let matched: Vec<String> = names
                    .into_iter()
                    .filter(|name| {
                        self.index_patterns
                            .iter()
                            .any(|pattern| matches_pattern(name, pattern))
                    })
                    .collect();
                if matched.is_empty() {
                    self.fallback_indices.clone()
                } else {
                    matched
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "index discovery failed, using fallback patterns");
                self.fallback_indices.clone()
            }
        }
    }

    /// Validate and clamp pagination parameters.
    fn normalize_paging(&self, params: &EventQueryParams) -> DshieldResult<(u32, u32)> {
        if params.page == 0 {
            return Err(ValidationError::OutOfRange {
                field: "page".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: u32::MAX.to_string(),
            }
            .into());
        }
        if params.page_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "page_size".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: self.config.max_page_size.to_string(),
            }
            .into());
        }
        // Oversized pages clamp rather than fail
        Ok((params.page, params.page_size.min(self.config.max_page_size)))
    }

    async fn run_search(
        &self,
        indices: &[String],
        body: &Value,
        timeout_seconds: u64,
    ) -> DshieldResult<Value> {
        let deadline = Duration::from_secs(timeout_seconds.max(1));
        match tokio::time::timeout(deadline, self.backend.search(indices, body)).await {
            Ok(result) => result,
            Err(_) => Err(DshieldError::timeout("search", deadline)),
        }
    }

    /// Query security events with pagination and smart optimization.
    pub async fn query_events(&self, params: &EventQueryParams) -> DshieldResult<EventPage> {
        self.query_event_family(params, true).await
    }

    /// Query attack events: the event family restricted to attack traffic.
    pub async fn query_attacks(&self, mut params: EventQueryParams) -> DshieldResult<EventPage> {
        params.filters.push(FilterExpr::eq(
            "event.category",
            json!(["attack", "intrusion", "malware"]),
        ));
        self.query_event_family(&params, true).await
    }

    /// Query reputation documents; endpoint existence is not required here.
    pub async fn query_reputation(
        &self,
        ips: Option<Vec<String>>,
        mut params: EventQueryParams,
    ) -> DshieldResult<EventPage> {
        params.filters.push(FilterExpr::exists("reputation"));
        if let Some(ips) = ips {
            params.filters.push(FilterExpr::in_values(
                "source.ip",
                ips.into_iter().map(Value::String).collect(),
            ));
        }
        self.query_event_family(&params, false).await
    }

    async fn query_event_family(
        &self,
        params: &EventQueryParams,
        require_endpoints: bool,
    ) -> DshieldResult<EventPage> {
        let (page, mut page_size) = self.normalize_paging(params)?;
        let indices = self.resolve_indices(params.indices.clone()).await;
        let time_range = TimeRange::last_hours(params.time_range_hours);
        let filters = map_filters(params.filters.clone());
        let query = build_event_query(&time_range, &filters, require_endpoints)?;

        let mut fields = params.fields.clone();
        let mut steps = Vec::new();

        if params.optimization == OptimizationLevel::Auto {
            let outcome = optimize::plan(
                self.backend.as_ref(),
                &indices,
                &json!({ "query": query }),
                fields.take(),
                page_size,
                params.max_result_size_mb,
            )
            .await?;

            fields = outcome.fields;
            page_size = outcome.page_size;
            steps = outcome.steps;

            if !outcome.within_budget {
                tracing::warn!(
                    estimated_mb = outcome.estimated_mb,
                    budget_mb = params.max_result_size_mb,
                    strategy = %params.fallback_strategy,
                    "query over budget after optimization, applying fallback"
                );
                return self
                    .apply_fallback(params, &indices, &query, steps)
                    .await;
            }
        }

        let sort = vec![SortSpec::new(params.sort_by.clone(), params.sort_order)];
        let search_after = match &params.cursor {
            Some(cursor) => Some(decode_cursor(cursor)?),
            None => None,
        };
        let from = if search_after.is_none() {
            Some(u64::from(page - 1) * u64::from(page_size))
        } else {
            None
        };

        let body = build_search_body(
            &query,
            page_size,
            from,
            search_after.as_deref(),
            &sort,
            fields.as_deref(),
            params.timeout_seconds,
        );

        let response = self.run_search(&indices, &body, params.timeout_seconds).await?;
        let total_count = extract_total(&response);
        let hits = extract_hits(&response);

        let events: Vec<SecurityEvent> = hits
            .iter()
            .filter_map(|hit| parse_event(hit, &indices))
            .collect();

        let mut pagination = if params.cursor.is_some() {
            let next = hits.last().and_then(|hit| next_cursor_from_hit(hit));
            PaginationInfo::cursor_based(
                page_size,
                total_count,
                params.cursor.clone(),
                next,
                params.sort_by.clone(),
                params.sort_order,
            )
        } else {
            PaginationInfo::page_based(
                page,
                page_size,
                total_count,
                params.sort_by.clone(),
                params.sort_order,
            )
        };
        pagination.optimization_applied = steps;

        tracing::info!(
            events = events.len(),
            total_count,
            indices = indices.len(),
            page,
            page_size,
            mode = if params.cursor.is_some() { "cursor" } else { "page" },
            "event query complete"
        );

        Ok(EventPage {
            events,
            total_count,
            pagination,
        })
    }

    async fn apply_fallback(
        &self,
        params: &EventQueryParams,
        indices: &[String],
        query: &Value,
        steps: Vec<dshield_core::OptimizationStep>,
    ) -> DshieldResult<EventPage> {
        match params.fallback_strategy {
            FallbackStrategy::Aggregate => self.aggregate_fallback(params, indices, query, steps).await,
            FallbackStrategy::Sample => self.sample_fallback(params, indices, query, steps).await,
            FallbackStrategy::None => {
                let mut pagination = PaginationInfo::page_based(
                    1,
                    0,
                    0,
                    params.sort_by.clone(),
                    params.sort_order,
                )
                .with_fallback(
                    FallbackStrategy::None,
                    "result set exceeds the size budget; narrow the query",
                );
                pagination.optimization_applied = steps;
                Ok(EventPage {
                    events: Vec::new(),
                    total_count: 0,
                    pagination,
                })
            }
        }
    }

    async fn aggregate_fallback(
        &self,
        params: &EventQueryParams,
        indices: &[String],
        query: &Value,
        steps: Vec<dshield_core::OptimizationStep>,
    ) -> DshieldResult<EventPage> {
        let body = json!({
            "query": query,
            "size": 0,
            "aggs": {
                "top_sources": { "terms": { "field": "source.ip", "size": 50 } },
                "top_destinations": { "terms": { "field": "destination.port", "size": 50 } },
                "event_categories": { "terms": { "field": "event.category", "size": 20 } },
                "timeline": { "date_histogram": { "field": "@timestamp", "calendar_interval": "1h" } }
            }
        });

        let response = self.run_search(indices, &body, params.timeout_seconds).await?;
        let total_count = extract_total(&response);
        let aggs = &response["aggregations"];
        let now = Utc::now();

        let mut events = Vec::new();
        for bucket in buckets(aggs, "top_sources") {
            let key = bucket_key(bucket);
            let doc_count = bucket["doc_count"].as_u64().unwrap_or(0);
            events.push(summary_event(
                format!("agg_source_{}", key),
                now,
                format!("Top source IP: {} with {} events", key, doc_count),
                json!({ "aggregation_type": "top_sources", "key": key, "doc_count": doc_count }),
                indices,
            ));
        }
        for bucket in buckets(aggs, "top_destinations") {
            let key = bucket_key(bucket);
            let doc_count = bucket["doc_count"].as_u64().unwrap_or(0);
            events.push(summary_event(
                format!("agg_dest_{}", key),
                now,
                format!("Top destination port: {} with {} events", key, doc_count),
                json!({ "aggregation_type": "top_destinations", "key": key, "doc_count": doc_count }),
                indices,
            ));
        }
        for bucket in buckets(aggs, "event_categories") {
            let key = bucket_key(bucket);
            let doc_count = bucket["doc_count"].as_u64().unwrap_or(0);
            events.push(summary_event(
                format!("agg_category_{}", key),
                now,
                format!("Event category: {} with {} events", key, doc_count),
                json!({ "aggregation_type": "event_categories", "key": key, "doc_count": doc_count }),
                indices,
            ));
        }

        let mut pagination = PaginationInfo::page_based(
            1,
            events.len() as u32,
            total_count,
            params.sort_by.clone(),
            params.sort_order,
        )
        .with_fallback(
            FallbackStrategy::Aggregate,
            "aggregation summaries returned because the full result set exceeds the size budget",
        );
        pagination.optimization_applied = steps;
        pagination.has_next = false;
        pagination.next_page = None;

        Ok(EventPage {
            events,
            total_count,
            pagination,
        })
    }

    async fn sample_fallback(
        &self,
        params: &EventQueryParams,
        indices: &[String],
        query: &Value,
        steps: Vec<dshield_core::OptimizationStep>,
    ) -> DshieldResult<EventPage> {
        const SAMPLE_SIZE: u32 = 10;
        let sort = vec![SortSpec::new(params.sort_by.clone(), params.sort_order)];
        let body = build_search_body(
            query,
            SAMPLE_SIZE,
            None,
            None,
            &sort,
            None,
            params.timeout_seconds,
        );

        let response = self.run_search(indices, &body, params.timeout_seconds).await?;
        let total_count = extract_total(&response);
        let events: Vec<SecurityEvent> = extract_hits(&response)
            .iter()
            .filter_map(|hit| parse_event(hit, indices))
            .collect();

        let mut pagination = PaginationInfo::page_based(
            1,
            SAMPLE_SIZE,
            total_count,
            params.sort_by.clone(),
            params.sort_order,
        )
        .with_fallback(
            FallbackStrategy::Sample,
            format!(
                "sample of {} events from {} total (dataset too large)",
                events.len(),
                total_count
            ),
        );
        pagination.optimization_applied = steps;

        Ok(EventPage {
            events,
            total_count,
            pagination,
        })
    }

    /// Events involving any of the given IPs, as source or destination.
    pub async fn query_events_by_ip(
        &self,
        ips: Vec<String>,
        params: &EventQueryParams,
    ) -> DshieldResult<EventPage> {
        if ips.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "ip_addresses".to_string(),
            }
            .into());
        }
        for ip in &ips {
            dshield_core::validate_ip(ip)?;
        }

        let (page, page_size) = self.normalize_paging(params)?;
        let indices = self.resolve_indices(params.indices.clone()).await;
        let time_range = TimeRange::last_hours(params.time_range_hours);
        let query = build_ip_query(&ips, &time_range);
        let body = build_search_body(
            &query,
            page_size,
            Some(u64::from(page - 1) * u64::from(page_size)),
            None,
            &default_sort(),
            None,
            params.timeout_seconds,
        );

        let response = self.run_search(&indices, &body, params.timeout_seconds).await?;
        let total_count = extract_total(&response);
        let events: Vec<SecurityEvent> = extract_hits(&response)
            .iter()
            .filter_map(|hit| parse_event(hit, &indices))
            .collect();

        Ok(EventPage {
            events,
            total_count,
            pagination: PaginationInfo::page_based(
                page,
                page_size,
                total_count,
                "@timestamp",
                SortOrder::Desc,
            ),
        })
    }

    async fn terms_aggregation(
        &self,
        time_range_hours: u32,
        field: &str,
        size: u32,
        timeout_seconds: u64,
    ) -> DshieldResult<Vec<(String, u64)>> {
        let indices = self.resolve_indices(None).await;
        let time_range = TimeRange::last_hours(time_range_hours);
        let query = build_event_query(&time_range, &[], false)?;
        let body = json!({
            "query": query,
            "size": 0,
            "aggs": { "top": { "terms": { "field": field, "size": size } } }
        });

        let response = self.run_search(&indices, &body, timeout_seconds).await?;
        Ok(buckets(&response["aggregations"], "top")
            .iter()
            .map(|bucket| {
                (
                    bucket_key(bucket),
                    bucket["doc_count"].as_u64().unwrap_or(0),
                )
            })
            .collect())
    }

    /// Top attacking source IPs over the time range.
    pub async fn top_attackers(
        &self,
        time_range_hours: u32,
        limit: u32,
    ) -> DshieldResult<Vec<TopAttacker>> {
        let buckets = self
            .terms_aggregation(time_range_hours, "source.ip", limit, self.config.timeout_seconds)
            .await?;
        Ok(buckets
            .into_iter()
            .map(|(ip_address, attack_count)| TopAttacker {
                ip_address,
                attack_count,
            })
            .collect())
    }

    /// Attack counts by source country.
    pub async fn geographic_data(
        &self,
        time_range_hours: u32,
        limit: u32,
    ) -> DshieldResult<Vec<GeographicSummary>> {
        let buckets = self
            .terms_aggregation(
                time_range_hours,
                "source.geo.country_name",
                limit,
                self.config.timeout_seconds,
            )
            .await?;
        Ok(buckets
            .into_iter()
            .map(|(country, attack_count)| GeographicSummary {
                country,
                attack_count,
            })
            .collect())
    }

    /// Attack counts by destination port.
    pub async fn port_data(
        &self,
        time_range_hours: u32,
        limit: u32,
    ) -> DshieldResult<Vec<PortSummary>> {
        let buckets = self
            .terms_aggregation(
                time_range_hours,
                "destination.port",
                limit,
                self.config.timeout_seconds,
            )
            .await?;
        Ok(buckets
            .into_iter()
            .filter_map(|(port, attack_count)| {
                port.parse::<u16>().ok().map(|port| PortSummary {
                    port,
                    attack_count,
                })
            })
            .collect())
    }

    /// Summary statistics: totals, severity/category breakdowns, unique IPs.
    pub async fn statistics(&self, time_range_hours: u32) -> DshieldResult<SiemStatistics> {
        let indices = self.resolve_indices(None).await;
        let time_range = TimeRange::last_hours(time_range_hours);
        let query = build_event_query(&time_range, &[], false)?;
        let body = json!({
            "query": query,
            "size": 0,
            "aggs": {
                "by_severity": { "terms": { "field": "event.severity", "size": 10 } },
                "by_category": { "terms": { "field": "event.category", "size": 20 } },
                "unique_sources": { "cardinality": { "field": "source.ip" } },
                "unique_destinations": { "cardinality": { "field": "destination.ip" } },
                "top_sources": { "terms": { "field": "source.ip", "size": 10 } }
            }
        });

        let response = self
            .run_search(&indices, &body, self.config.timeout_seconds)
            .await?;
        let aggs = &response["aggregations"];

        Ok(SiemStatistics {
            time_range_hours,
            total_events: extract_total(&response),
            events_by_severity: buckets(aggs, "by_severity")
                .iter()
                .map(|b| (bucket_key(b), b["doc_count"].as_u64().unwrap_or(0)))
                .collect(),
            events_by_category: buckets(aggs, "by_category")
                .iter()
                .map(|b| (bucket_key(b), b["doc_count"].as_u64().unwrap_or(0)))
                .collect(),
            unique_source_ips: aggs["unique_sources"]["value"].as_u64().unwrap_or(0),
            unique_destination_ips: aggs["unique_destinations"]["value"].as_u64().unwrap_or(0),
            top_source_ips: buckets(aggs, "top_sources")
                .iter()
                .map(|b| TopAttacker {
                    ip_address: bucket_key(b),
                    attack_count: b["doc_count"].as_u64().unwrap_or(0),
                })
                .collect(),
            indices_queried: indices,
        })
    }
}

impl std::fmt::Debug for SiemEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiemEngine")
            .field("index_patterns", &self.index_patterns)
            .field("fallback_indices", &self.fallback_indices)
            .finish()
    }
}

/// Simple glob match supporting a trailing `*`.
pub(crate) fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

pub(crate) fn extract_total(response: &Value) -> u64 {
    response["hits"]["total"]["value"].as_u64().unwrap_or(0)
}

pub(crate) fn extract_hits(response: &Value) -> Vec<Value> {
    response["hits"]["hits"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn next_cursor_from_hit(hit: &Value) -> Option<String> {
    if let Some(sort_values) = hit.get("sort").and_then(Value::as_array) {
        if let Some(cursor) = encode_cursor(sort_values) {
            return Some(cursor);
        }
    }
    // Backend omitted sort values: fall back to the document timestamp
    hit.pointer("/_source/@timestamp")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn buckets<'a>(aggs: &'a Value, name: &str) -> Vec<&'a Value> {
    aggs[name]["buckets"]
        .as_array()
        .map(|array| array.iter().collect())
        .unwrap_or_default()
}

fn bucket_key(bucket: &Value) -> String {
    match &bucket["key"] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn summary_event(
    id: String,
    timestamp: chrono::DateTime<Utc>,
    description: String,
    raw_data: Value,
    indices: &[String],
) -> SecurityEvent {
    SecurityEvent {
        id,
        timestamp,
        source_ip: None,
        destination_ip: None,
        source_port: None,
        destination_port: None,
        protocol: None,
        event_type: "aggregation".to_string(),
        severity: Default::default(),
        category: EventCategory::Other,
        description,
        country: None,
        asn: None,
        organization: None,
        reputation_score: None,
        attack_count: raw_data["doc_count"].as_u64(),
        first_seen: None,
        last_seen: None,
        tags: BTreeSet::from(["summary".to_string()]),
        attack_types: BTreeSet::new(),
        raw_data,
        indices: indices.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted backend: records request bodies, pops canned responses.
    #[derive(Default)]
    struct MockBackend {
        search_responses: Mutex<Vec<Value>>,
        search_bodies: Mutex<Vec<Value>>,
        count: u64,
        indices: Vec<String>,
        search_delay: Option<Duration>,
    }

    impl MockBackend {
        fn with_search(responses: Vec<Value>) -> Self {
            Self {
                search_responses: Mutex::new(responses),
                ..Default::default()
            }
        }

        fn recorded_bodies(&self) -> Vec<Value> {
            self.search_bodies.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl SearchBackend for MockBackend {
        async fn search(&self, _indices: &[String], body: &Value) -> DshieldResult<Value> {
            if let Some(delay) = self.search_delay {
                tokio::time::sleep(delay).await;
            }
            self.search_bodies.lock().expect("lock").push(body.clone());
            let mut responses = self.search_responses.lock().expect("lock");
            if responses.is_empty() {
                Ok(json!({ "hits": { "total": { "value": 0 }, "hits": [] } }))
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn count(&self, _: &[String], _: &Value) -> DshieldResult<u64> {
            Ok(self.count)
        }

        async fn list_indices(&self) -> DshieldResult<Vec<String>> {
            Ok(self.indices.clone())
        }

        async fn get_mapping(&self, _: &str) -> DshieldResult<Value> {
            Ok(json!({}))
        }

        async fn cluster_health(&self) -> DshieldResult<Value> {
            Ok(json!({ "status": "green" }))
        }

        async fn cluster_stats(&self) -> DshieldResult<Value> {
            Ok(json!({}))
        }

        async fn index_document(&self, _: &str, _: &str, _: &Value) -> DshieldResult<()> {
            Ok(())
        }
    }

    fn engine(backend: MockBackend) -> SiemEngine {
        SiemEngine::new(
            Arc::new(backend),
            QueryConfig::default(),
            vec!["dshield-*".to_string()],
            vec!["dshield-*".to_string()],
        )
    }

    fn hit(id: &str, timestamp: &str, source_ip: &str) -> Value {
        json!({
            "_id": id,
            "_source": {
                "@timestamp": timestamp,
                "source": { "ip": source_ip },
                "event": { "category": "network" }
            },
            "sort": [1735689600000i64]
        })
    }

    #[tokio::test]
    async fn test_page_based_query() {
        let response = json!({
            "hits": {
                "total": { "value": 45 },
                "hits": [hit("e1", "2025-01-01T00:00:00Z", "192.0.2.10")]
            }
        });
        let engine = engine(MockBackend::with_search(vec![response]));

        let params = EventQueryParams {
            page: 2,
            page_size: 10,
            optimization: OptimizationLevel::None,
            filters: vec![FilterExpr::eq("source_ip", json!("192.0.2.10"))],
            ..Default::default()
        };
        let page = engine.query_events(&params).await.expect("query should succeed");

        assert_eq!(page.total_count, 45);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.pagination.current_page, 2);
        assert_eq!(page.pagination.start_index, 11);
        assert!(page.pagination.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_from_offset_and_alias_in_body() {
        let backend = Arc::new(MockBackend::default());
        let engine_under_test = SiemEngine::new(
            backend.clone(),
            QueryConfig::default(),
            vec!["dshield-*".to_string()],
            vec!["dshield-*".to_string()],
        );
        let params = EventQueryParams {
            page: 3,
            page_size: 25,
            optimization: OptimizationLevel::None,
            filters: vec![FilterExpr::eq("source_ip", json!("192.0.2.1"))],
            ..Default::default()
        };
        engine_under_test
            .query_events(&params)
            .await
            .expect("query should succeed");

        let bodies = backend.recorded_bodies();
        assert_eq!(bodies[0]["from"], json!(50));
        assert_eq!(bodies[0]["size"], json!(25));
        let body_text = bodies[0].to_string();
        assert!(body_text.contains("source.ip"), "alias must be applied: {}", body_text);
        assert!(!body_text.contains("source_ip"));
    }

    #[tokio::test]
    async fn test_page_size_zero_rejected_and_oversize_clamped() {
        let engine = engine(MockBackend::default());

        let mut params = EventQueryParams {
            page_size: 0,
            optimization: OptimizationLevel::None,
            ..Default::default()
        };
        let err = engine.query_events(&params).await.expect_err("should fail");
        assert_eq!(err.rpc_code(), -32602);

        params.page_size = QueryConfig::default().max_page_size + 1;
        let page = engine.query_events(&params).await.expect("query should succeed");
        assert_eq!(
            page.pagination.page_size,
            QueryConfig::default().max_page_size
        );
    }

    #[tokio::test]
    async fn test_cursor_mode_emits_next_cursor() {
        let response = json!({
            "hits": {
                "total": { "value": 6 },
                "hits": [
                    hit("e1", "2025-01-01T00:00:02Z", "192.0.2.1"),
                    {
                        "_id": "e2",
                        "_source": { "@timestamp": "2025-01-01T00:00:01Z" },
                        "sort": [1735689601000i64]
                    }
                ]
            }
        });
        let engine = engine(MockBackend::with_search(vec![response]));

        let params = EventQueryParams {
            cursor: Some("1735689700000".to_string()),
            optimization: OptimizationLevel::None,
            ..Default::default()
        };
        let page = engine.query_events(&params).await.expect("query should succeed");

        assert_eq!(
            page.pagination.next_page_token.as_deref(),
            Some("1735689601000")
        );
        assert_eq!(
            page.pagination.current_cursor.as_deref(),
            Some("1735689700000")
        );
    }

    #[tokio::test]
    async fn test_aggregate_fallback_synthesizes_summaries() {
        let agg_response = json!({
            "hits": { "total": { "value": 250000 }, "hits": [] },
            "aggregations": {
                "top_sources": { "buckets": [
                    { "key": "192.0.2.1", "doc_count": 120000 },
                    { "key": "192.0.2.2", "doc_count": 80000 }
                ]},
                "top_destinations": { "buckets": [ { "key": 22, "doc_count": 150000 } ] },
                "event_categories": { "buckets": [ { "key": "network", "doc_count": 250000 } ] },
                "timeline": { "buckets": [] }
            }
        });
        let backend = MockBackend {
            search_responses: Mutex::new(vec![agg_response]),
            count: 250_000,
            ..Default::default()
        };
        let engine = engine(backend);

        let params = EventQueryParams {
            time_range_hours: 720,
            max_result_size_mb: 0.01,
            fallback_strategy: FallbackStrategy::Aggregate,
            ..Default::default()
        };
        let page = engine.query_events(&params).await.expect("query should succeed");

        assert_eq!(page.total_count, 250_000);
        assert_eq!(page.events.len(), 4);
        assert!(page.events.iter().all(|e| e.event_type == "aggregation"));
        assert_eq!(
            page.pagination.fallback_strategy,
            Some(FallbackStrategy::Aggregate)
        );
        assert!(!page.pagination.has_next);
    }

    #[tokio::test]
    async fn test_sample_fallback_returns_true_total() {
        let sample_response = json!({
            "hits": {
                "total": { "value": 99999 },
                "hits": [hit("s1", "2025-01-01T00:00:00Z", "192.0.2.1")]
            }
        });
        let backend = MockBackend {
            search_responses: Mutex::new(vec![sample_response]),
            count: 99_999,
            ..Default::default()
        };
        let engine = engine(backend);

        let params = EventQueryParams {
            max_result_size_mb: 0.001,
            fallback_strategy: FallbackStrategy::Sample,
            ..Default::default()
        };
        let page = engine.query_events(&params).await.expect("query should succeed");

        assert_eq!(page.total_count, 99_999);
        assert_eq!(page.events.len(), 1);
        assert_eq!(
            page.pagination.fallback_strategy,
            Some(FallbackStrategy::Sample)
        );
    }

    #[tokio::test]
    async fn test_none_fallback_returns_empty_annotated() {
        let backend = MockBackend {
            count: 1_000_000,
            ..Default::default()
        };
        let engine = engine(backend);

        let params = EventQueryParams {
            max_result_size_mb: 0.001,
            fallback_strategy: FallbackStrategy::None,
            ..Default::default()
        };
        let page = engine.query_events(&params).await.expect("query should succeed");
        assert!(page.events.is_empty());
        assert_eq!(page.total_count, 0);
        assert_eq!(page.pagination.fallback_strategy, Some(FallbackStrategy::None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout() {
        let backend = MockBackend {
            search_delay: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        let engine = engine(backend);

        let params = EventQueryParams {
            optimization: OptimizationLevel::None,
            timeout_seconds: 5,
            ..Default::default()
        };
        let err = engine.query_events(&params).await.expect_err("should time out");
        assert!(matches!(err, DshieldError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_index_discovery_filters_patterns() {
        let backend = MockBackend {
            indices: vec![
                "dshield-2025.01".to_string(),
                "kibana_internal".to_string(),
                "dshield-2025.02".to_string(),
            ],
            ..Default::default()
        };
        let engine = engine(backend);
        let resolved = engine.resolve_indices(None).await;
        assert_eq!(resolved, vec!["dshield-2025.01", "dshield-2025.02"]);
    }

    #[tokio::test]
    async fn test_index_discovery_fallback_when_empty() {
        let engine = engine(MockBackend::default());
        let resolved = engine.resolve_indices(None).await;
        assert_eq!(resolved, vec!["dshield-*"]);
    }

    #[tokio::test]
    async fn test_top_attackers() {
        let response = json!({
            "hits": { "total": { "value": 100 }, "hits": [] },
            "aggregations": {
                "top": { "buckets": [
                    { "key": "192.0.2.1", "doc_count": 60 },
                    { "key": "192.0.2.2", "doc_count": 40 }
                ]}
            }
        });
        let engine = engine(MockBackend::with_search(vec![response]));
        let attackers = engine.top_attackers(24, 10).await.expect("query should succeed");
        assert_eq!(
            attackers,
            vec![
                TopAttacker { ip_address: "192.0.2.1".into(), attack_count: 60 },
                TopAttacker { ip_address: "192.0.2.2".into(), attack_count: 40 },
            ]
        );
    }

    #[tokio::test]
    async fn test_events_by_ip_validates_addresses() {
        let engine = engine(MockBackend::default());
        let err = engine
            .query_events_by_ip(vec!["not-an-ip".to_string()], &EventQueryParams::default())
            .await
            .expect_err("should fail");
        assert_eq!(err.rpc_code(), -32602);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("dshield-2025.01", "dshield-*"));
        assert!(matches_pattern("anything", "*"));
        assert!(matches_pattern("cowrie-logs", "cowrie-*"));
        assert!(!matches_pattern("zeek-conn", "dshield-*"));
        assert!(matches_pattern("exact", "exact"));
    }
}

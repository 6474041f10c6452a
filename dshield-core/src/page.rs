//! Pagination and streaming metadata

use crate::{FallbackStrategy, SortOrder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A degradation step the optimizer applied to fit the byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStep {
    FieldReduction,
    PageReduction,
}

/// Pagination metadata returned with every query response.
///
/// Covers both page-based and cursor-based pagination; cursor fields are
/// `None` for page-based requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationInfo {
    /// Current page number (1-based).
    pub current_page: u32,
    /// Effective page size after optimization.
    pub page_size: u32,
    /// Total matching documents.
    pub total_count: u64,
    /// Total pages at the effective page size.
    pub total_pages: u64,
    /// Whether a next page exists.
    pub has_next: bool,
    /// Whether a previous page exists.
    pub has_previous: bool,
    /// Next page number, when one exists.
    pub next_page: Option<u32>,
    /// Previous page number, when one exists.
    pub previous_page: Option<u32>,
    /// 1-based index of the first document on this page.
    pub start_index: u64,
    /// 1-based index of the last document on this page.
    pub end_index: u64,
    /// Sort field.
    pub sort_by: String,
    /// Sort direction.
    pub sort_order: SortOrder,
    /// Opaque token for the next chunk in cursor mode; `None` at the end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    /// The cursor this response was produced from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cursor: Option<String>,
    /// Degradation steps applied by the optimizer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimization_applied: Vec<OptimizationStep>,
    /// Fallback strategy used, if the cascade bottomed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_strategy: Option<FallbackStrategy>,
    /// Free-form annotation for degraded responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PaginationInfo {
    /// Metadata for a page-based response.
    pub fn page_based(
        page: u32,
        page_size: u32,
        total_count: u64,
        sort_by: impl Into<String>,
        sort_order: SortOrder,
    ) -> Self {
        let size = u64::from(page_size.max(1));
        let total_pages = total_count.div_ceil(size).max(1);
        let page64 = u64::from(page);
        let has_next = page64 < total_pages && total_count > 0;
        let has_previous = page > 1;
        let start_index = if total_count == 0 {
            0
        } else {
            (page64 - 1) * size + 1
        };
        let end_index = (page64 * size).min(total_count);

        Self {
            current_page: page,
            page_size,
            total_count,
            total_pages,
            has_next,
            has_previous,
            next_page: has_next.then(|| page + 1),
            previous_page: has_previous.then(|| page - 1),
            start_index,
            end_index,
            sort_by: sort_by.into(),
            sort_order,
            next_page_token: None,
            current_cursor: None,
            optimization_applied: Vec::new(),
            fallback_strategy: None,
            note: None,
        }
    }

    /// Metadata for a cursor-based response.
    pub fn cursor_based(
        page_size: u32,
        total_count: u64,
        current_cursor: Option<String>,
        next_page_token: Option<String>,
        sort_by: impl Into<String>,
        sort_order: SortOrder,
    ) -> Self {
        let mut info = Self::page_based(1, page_size, total_count, sort_by, sort_order);
        info.has_next = next_page_token.is_some();
        info.next_page = None;
        info.current_cursor = current_cursor;
        info.next_page_token = next_page_token;
        info
    }

    /// Attach a fallback annotation.
    pub fn with_fallback(mut self, strategy: FallbackStrategy, note: impl Into<String>) -> Self {
        self.fallback_strategy = Some(strategy);
        self.note = Some(note.into());
        self
    }
}

/// Summary of one session emitted in a streaming chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Composite session key, or `no_session`.
    pub session_key: String,
    /// Events in this session within the chunk.
    pub event_count: usize,
    /// Earliest event timestamp in the session.
    pub first_timestamp: Option<DateTime<Utc>>,
    /// Latest event timestamp in the session.
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Session duration in minutes.
    pub duration_minutes: Option<f64>,
    /// Echo of the session-field values that keyed the group.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Per-query performance metrics for session streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamMetrics {
    /// Backend round-trip time in milliseconds.
    pub query_time_ms: u64,
    /// Number of indices scanned.
    pub indices_scanned: usize,
    /// Total documents matched by the query.
    pub total_documents_examined: u64,
    /// Sessions found among fetched candidates.
    pub sessions_processed: usize,
    /// Shards reported by the backend.
    pub shards_scanned: u64,
}

/// Session context attached to a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Fields used to form session keys.
    pub session_fields: Vec<String>,
    /// Configured maximum intra-session gap.
    pub max_session_gap_minutes: u32,
    /// Number of sessions emitted in this chunk.
    pub sessions_in_chunk: usize,
    /// Summaries of emitted sessions.
    pub session_summaries: Vec<SessionSummary>,
    /// Performance metrics for this query.
    pub performance_metrics: StreamMetrics,
}

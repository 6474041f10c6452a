//! Cursor streaming and session-aware chunking
//!
//! Plain streaming pages through documents with `search_after` on
//! `(@timestamp, _id)`. Session-aware streaming over-fetches candidates,
//! groups them by session-key fields, and emits whole sessions per chunk so
//! related events stay together.

use crate::client::SearchBackend;
use crate::cursor::{decode_cursor, encode_cursor};
use crate::engine::{extract_hits, extract_total, next_cursor_from_hit, SiemEngine};
use crate::parse::{self, parse_event};
use crate::query::{build_event_query, build_search_body};
use chrono::{DateTime, Utc};
use dshield_core::{
    map_filters, DshieldResult, FilterExpr, SecurityEvent, SessionContext, SessionSummary,
    SortOrder, SortSpec, StreamMetrics, TimeRange, ValidationError,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default fields used to form session keys.
pub const DEFAULT_SESSION_FIELDS: [&str; 4] =
    ["source.ip", "destination.ip", "user.name", "session.id"];

/// Key for documents carrying none of the session fields.
const NO_SESSION_KEY: &str = "no_session";

/// Hard ceiling on candidate over-fetch.
const MAX_CANDIDATES: u32 = 2000;

/// Parameters for plain cursor streaming.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub time_range_hours: u32,
    pub indices: Option<Vec<String>>,
    pub filters: Vec<FilterExpr>,
    pub fields: Option<Vec<String>>,
    pub chunk_size: u32,
    pub cursor: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            time_range_hours: 24,
            indices: None,
            filters: Vec::new(),
            fields: None,
            chunk_size: 500,
            cursor: None,
            timeout_seconds: 30,
        }
    }
}

/// Parameters for session-aware streaming.
#[derive(Debug, Clone)]
pub struct SessionStreamParams {
    pub stream: StreamParams,
    pub session_fields: Vec<String>,
    pub max_session_gap_minutes: u32,
    pub include_session_summary: bool,
}

impl Default for SessionStreamParams {
    fn default() -> Self {
        Self {
            stream: StreamParams::default(),
            session_fields: DEFAULT_SESSION_FIELDS.iter().map(|s| s.to_string()).collect(),
            max_session_gap_minutes: 30,
            include_session_summary: true,
        }
    }
}

/// One chunk of a stream.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StreamChunk {
    pub events: Vec<SecurityEvent>,
    pub total_count: u64,
    pub next_cursor: Option<String>,
    pub session_context: Option<SessionContext>,
}

#[derive(Debug, Default)]
struct SessionGroup {
    events: Vec<SecurityEvent>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
    metadata: BTreeMap<String, String>,
}

impl SessionGroup {
    fn push(&mut self, event: SecurityEvent) {
        let ts = event.timestamp;
        self.first_timestamp = Some(self.first_timestamp.map_or(ts, |cur| cur.min(ts)));
        self.last_timestamp = Some(self.last_timestamp.map_or(ts, |cur| cur.max(ts)));
        self.events.push(event);
    }

    fn duration_minutes(&self) -> Option<f64> {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => {
                let minutes = (last - first).num_milliseconds() as f64 / 60_000.0;
                Some((minutes * 100.0).round() / 100.0)
            }
            _ => None,
        }
    }
}

impl SiemEngine {
    fn stream_sort() -> Vec<SortSpec> {
        vec![
            SortSpec::new("@timestamp", SortOrder::Desc),
            SortSpec::new("_id", SortOrder::Desc),
        ]
    }

    /// Stream events in cursor-ordered chunks.
    ///
    /// Chunks never overlap: progressing through returned cursors delivers
    /// each document at most once, and replaying a cursor replays its chunk.
    pub async fn stream_events(&self, params: &StreamParams) -> DshieldResult<StreamChunk> {
        if params.chunk_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "chunk_size".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: MAX_CANDIDATES.to_string(),
            }
            .into());
        }

        let indices = self.resolve_indices(params.indices.clone()).await;
        let time_range = TimeRange::last_hours(params.time_range_hours);
        let filters = map_filters(params.filters.clone());
        let query = build_event_query(&time_range, &filters, true)?;

        let search_after = match &params.cursor {
            Some(cursor) => Some(decode_cursor(cursor)?),
            None => None,
        };

        let body = build_search_body(
            &query,
            params.chunk_size,
            None,
            search_after.as_deref(),
            &Self::stream_sort(),
            params.fields.as_deref(),
            params.timeout_seconds,
        );

        let response = self
            .backend()
            .search(&indices, &body)
            .await?;
        let total_count = extract_total(&response);
        let hits = extract_hits(&response);

        let events: Vec<SecurityEvent> = hits
            .iter()
            .filter_map(|hit| parse_event(hit, &indices))
            .collect();

        // A short page means the stream is drained
        let next_cursor = if hits.len() == params.chunk_size as usize {
            hits.last().and_then(next_cursor_from_hit)
        } else {
            None
        };

        Ok(StreamChunk {
            events,
            total_count,
            next_cursor,
            session_context: None,
        })
    }

    /// Stream events with session-aware chunking.
    pub async fn stream_events_with_sessions(
        &self,
        params: &SessionStreamParams,
    ) -> DshieldResult<StreamChunk> {
        let stream = &params.stream;
        if stream.chunk_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "chunk_size".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: MAX_CANDIDATES.to_string(),
            }
            .into());
        }

        let indices = self.resolve_indices(stream.indices.clone()).await;
        let time_range = TimeRange::last_hours(stream.time_range_hours);
        let filters = map_filters(stream.filters.clone());
        let query = build_event_query(&time_range, &filters, true)?;

        let fetch_size = (stream.chunk_size * 2).min(MAX_CANDIDATES);
        let search_after = match &stream.cursor {
            Some(cursor) => Some(decode_cursor(cursor)?),
            None => None,
        };

        let body = build_search_body(
            &query,
            fetch_size,
            None,
            search_after.as_deref(),
            &Self::stream_sort(),
            stream.fields.as_deref(),
            stream.timeout_seconds,
        );

        let query_start = std::time::Instant::now();
        let response = self.backend().search(&indices, &body).await?;
        let query_time_ms = query_start.elapsed().as_millis() as u64;

        let total_count = extract_total(&response);
        let hits = extract_hits(&response);
        let shards_scanned = response["_shards"]["total"].as_u64().unwrap_or(0);

        // Group candidates into sessions keyed by the session-field values
        let mut groups: BTreeMap<String, SessionGroup> = BTreeMap::new();
        for hit in &hits {
            let Some(event) = parse_event(hit, &indices) else {
                continue;
            };
            let source = &hit["_source"];
            let (key, metadata) = session_key(source, &params.session_fields);
            let group = groups.entry(key).or_default();
            if group.metadata.is_empty() {
                group.metadata = metadata;
            }
            group.push(event);
        }
        let sessions_processed = groups.len();

        // Newest sessions first
        let mut ordered: Vec<(String, SessionGroup)> = groups.into_iter().collect();
        ordered.sort_by(|a, b| b.1.last_timestamp.cmp(&a.1.last_timestamp));

        let mut events: Vec<SecurityEvent> = Vec::new();
        let mut summaries: Vec<SessionSummary> = Vec::new();
        let mut sessions_in_chunk = 0usize;

        for (key, group) in ordered {
            // A single oversized session still ships alone as one chunk
            if !events.is_empty()
                && events.len() + group.events.len() > stream.chunk_size as usize
            {
                break;
            }

            if params.include_session_summary {
                summaries.push(SessionSummary {
                    session_key: key,
                    event_count: group.events.len(),
                    first_timestamp: group.first_timestamp,
                    last_timestamp: group.last_timestamp,
                    duration_minutes: group.duration_minutes(),
                    metadata: group.metadata.clone(),
                });
            }
            sessions_in_chunk += 1;
            events.extend(group.events);
        }

        // Cursor advances over everything fetched, emitted or not, so the
        // next fetch never replays these candidates.
        let next_cursor = if hits.len() == fetch_size as usize {
            hits.last().and_then(next_cursor_from_hit)
        } else {
            None
        };

        tracing::info!(
            events = events.len(),
            sessions_in_chunk,
            sessions_processed,
            total_count,
            query_time_ms,
            "session stream chunk complete"
        );

        Ok(StreamChunk {
            events,
            total_count,
            next_cursor,
            session_context: Some(SessionContext {
                session_fields: params.session_fields.clone(),
                max_session_gap_minutes: params.max_session_gap_minutes,
                sessions_in_chunk,
                session_summaries: summaries,
                performance_metrics: StreamMetrics {
                    query_time_ms,
                    indices_scanned: indices.len(),
                    total_documents_examined: total_count,
                    sessions_processed,
                    shards_scanned,
                },
            }),
        })
    }
}

/// Build the composite session key and its metadata echo.
fn session_key(source: &Value, session_fields: &[String]) -> (String, BTreeMap<String, String>) {
    let mut parts = Vec::new();
    let mut metadata = BTreeMap::new();

    for field in session_fields {
        if let Some(value) = parse::lookup(source, field) {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            parts.push(format!("{}:{}", field, text));
            metadata.insert(field.clone(), text);
        }
    }

    if parts.is_empty() {
        (
            NO_SESSION_KEY.to_string(),
            BTreeMap::from([("type".to_string(), NO_SESSION_KEY.to_string())]),
        )
    } else {
        (parts.join("|"), metadata)
    }
}

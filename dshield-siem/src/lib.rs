//! DShield MCP SIEM engine
//!
//! Client, query builder, optimization pipeline, pagination, and streaming
//! against an Elasticsearch-compatible cluster. The engine talks to the
//! cluster through the [`SearchBackend`] trait so everything above the HTTP
//! layer is testable without a live cluster.

mod client;
mod cursor;
mod diagnose;
mod engine;
mod optimize;
mod parse;
mod query;
mod stream;

pub use client::{ElasticsearchClient, SearchBackend};
pub use cursor::{decode_cursor, encode_cursor};
pub use diagnose::{diagnose_data_availability, DiagnosisOptions, DiagnosisReport};
pub use engine::{
    EventPage, EventQueryParams, GeographicSummary, PortSummary, SiemEngine, SiemStatistics,
    TopAttacker,
};
pub use optimize::{estimate_size_mb, reduce_fields, OptimizationOutcome, PRIORITY_FIELDS};
pub use parse::parse_event;
pub use query::{build_event_query, build_ip_query, build_search_body, filter_clauses};
pub use stream::{SessionStreamParams, StreamChunk, StreamParams};

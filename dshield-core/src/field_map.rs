//! Static field alias table
//!
//! Maps user-friendly filter keys (`source_ip`) to the backend's canonical
//! ECS names (`source.ip`). The table is materialized once at startup and
//! applied to filter keys before a query is built; unmapped keys pass
//! through verbatim and are logged as candidates for future mapping.

use crate::FilterExpr;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// User-friendly name -> canonical ECS field.
static FIELD_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // IP address fields
        ("source_ip", "source.ip"),
        ("src_ip", "source.ip"),
        ("sourceip", "source.ip"),
        ("destination_ip", "destination.ip"),
        ("dest_ip", "destination.ip"),
        ("destinationip", "destination.ip"),
        ("target_ip", "destination.ip"),
        // Port fields
        ("source_port", "source.port"),
        ("src_port", "source.port"),
        ("destination_port", "destination.port"),
        ("dest_port", "destination.port"),
        ("target_port", "destination.port"),
        // Event fields
        ("event_type", "event.type"),
        ("eventtype", "event.type"),
        ("event_category", "event.category"),
        ("eventcategory", "event.category"),
        ("event_kind", "event.kind"),
        ("eventkind", "event.kind"),
        ("event_outcome", "event.outcome"),
        ("eventoutcome", "event.outcome"),
        // Network fields
        ("protocol", "network.protocol"),
        ("network_protocol", "network.protocol"),
        ("network_type", "network.type"),
        ("networktype", "network.type"),
        ("network_direction", "network.direction"),
        ("networkdirection", "network.direction"),
        // HTTP fields
        ("http_method", "http.request.method"),
        ("httpmethod", "http.request.method"),
        ("http_status", "http.response.status_code"),
        ("httpstatus", "http.response.status_code"),
        ("http_version", "http.version"),
        ("httpversion", "http.version"),
        // URL fields
        ("url", "url.original"),
        ("url_original", "url.original"),
        ("url_path", "url.path"),
        ("urlpath", "url.path"),
        ("url_query", "url.query"),
        ("urlquery", "url.query"),
        // User agent fields
        ("user_agent", "user_agent.original"),
        ("useragent", "user_agent.original"),
        ("ua", "user_agent.original"),
        // Geographic fields; bare "country" defaults to the source side
        ("source_country", "source.geo.country_name"),
        ("sourcecountry", "source.geo.country_name"),
        ("dest_country", "destination.geo.country_name"),
        ("destcountry", "destination.geo.country_name"),
        ("country", "source.geo.country_name"),
        // Timestamp fields
        ("timestamp", "@timestamp"),
        ("time", "@timestamp"),
        ("date", "@timestamp"),
        // Severity and description
        ("severity", "event.severity"),
        ("description", "event.description"),
        ("message", "log.message"),
        ("log_message", "log.message"),
    ])
});

/// Map a user-friendly field name to its canonical form.
///
/// Unmapped names are returned unchanged.
pub fn canonical_field(name: &str) -> &str {
    FIELD_ALIASES.get(name).copied().unwrap_or(name)
}

/// Whether the table contains an alias for `name`.
pub fn is_mapped(name: &str) -> bool {
    FIELD_ALIASES.contains_key(name)
}

/// Map all filter keys to canonical field names. Pure function.
///
/// Unmapped, non-dotted keys are logged once per call as candidates for
/// future aliases.
pub fn map_filters(filters: Vec<FilterExpr>) -> Vec<FilterExpr> {
    let mut unmapped: Vec<String> = Vec::new();
    let mapped = filters
        .into_iter()
        .map(|mut filter| {
            let canonical = canonical_field(&filter.field);
            if canonical != filter.field {
                tracing::debug!(from = %filter.field, to = %canonical, "field alias applied");
                filter.field = canonical.to_string();
            } else if !is_mapped(&filter.field) && !filter.field.contains('.') {
                unmapped.push(filter.field.clone());
            }
            filter
        })
        .collect();

    if !unmapped.is_empty() {
        tracing::info!(
            fields = ?unmapped,
            "unmapped filter fields; consider ECS dot notation or adding aliases"
        );
    }

    mapped
}

/// Suggest likely canonical names for an unmapped field.
pub fn field_suggestions(field_name: &str) -> Vec<String> {
    let mut suggestions = Vec::new();

    if let Some(base) = field_name.strip_suffix("_ip") {
        suggestions.push(format!("{}.ip", base));
        suggestions.push(
            if base.contains("source") {
                "source.ip"
            } else {
                "destination.ip"
            }
            .to_string(),
        );
    } else if let Some(base) = field_name.strip_suffix("_port") {
        suggestions.push(format!("{}.port", base));
        suggestions.push(
            if base.contains("source") {
                "source.port"
            } else {
                "destination.port"
            }
            .to_string(),
        );
    } else if let Some(base) = field_name.strip_suffix("_type") {
        suggestions.push(format!("{}.type", base));
        suggestions.push("event.type".to_string());
    } else if let Some(base) = field_name.strip_suffix("_category") {
        suggestions.push(format!("{}.category", base));
        suggestions.push("event.category".to_string());
    }

    suggestions
}

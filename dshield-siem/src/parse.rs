//! Hit parsing
//!
//! Turns one backend hit into a [`SecurityEvent`]. Sensor fleets disagree on
//! field names, so each logical attribute has an ordered candidate list;
//! the first present candidate wins. Candidates are tried as literal keys
//! first (flattened documents), then as dotted paths into nested objects.

use chrono::{DateTime, Utc};
use dshield_core::{
    validate_ip, validate_port, EventCategory, EventSeverity, SecurityEvent,
};
use serde_json::Value;
use std::collections::BTreeSet;

const TIMESTAMP_FIELDS: &[&str] = &["@timestamp", "timestamp", "time", "date", "event.ingested"];
const SOURCE_IP_FIELDS: &[&str] = &[
    "source.ip",
    "src_ip",
    "srcip",
    "sourceip",
    "attacker_ip",
    "src",
    "client_ip",
    "source.address",
];
const DESTINATION_IP_FIELDS: &[&str] = &[
    "destination.ip",
    "dst_ip",
    "dstip",
    "destinationip",
    "target_ip",
    "dst",
    "server_ip",
    "destination.address",
];
const SOURCE_PORT_FIELDS: &[&str] = &["source.port", "src_port", "srcport", "sport", "client_port"];
const DESTINATION_PORT_FIELDS: &[&str] =
    &["destination.port", "dst_port", "dstport", "dport", "server_port"];
const PROTOCOL_FIELDS: &[&str] = &["network.protocol", "protocol", "proto", "transport_protocol"];
const EVENT_TYPE_FIELDS: &[&str] = &["event.type", "type", "eventtype", "event_type"];
const CATEGORY_FIELDS: &[&str] = &["event.category", "category", "event_category"];
const SEVERITY_FIELDS: &[&str] = &["event.severity", "severity", "level", "risk_level"];
const DESCRIPTION_FIELDS: &[&str] = &[
    "event.description",
    "message",
    "description",
    "summary",
    "event.original",
];
const COUNTRY_FIELDS: &[&str] = &["source.geo.country_name", "country", "country_name"];
const ASN_FIELDS: &[&str] = &["asn", "as_number", "autonomous_system", "source.geo.asn"];
const ORGANIZATION_FIELDS: &[&str] = &["org", "organization", "org_name", "source.geo.organization_name"];
const REPUTATION_FIELDS: &[&str] = &["reputation", "reputation_score", "dshield_score"];
const ATTACK_COUNT_FIELDS: &[&str] = &["count", "attack_count", "hits", "attempts"];
const FIRST_SEEN_FIELDS: &[&str] = &["firstseen", "first_seen", "first_seen_date"];
const LAST_SEEN_FIELDS: &[&str] = &["lastseen", "last_seen", "last_seen_date"];
const TAG_FIELDS: &[&str] = &["tags", "event.tags", "labels"];
const ATTACK_TYPE_FIELDS: &[&str] = &["attacks", "attack_types", "attack_methods"];

/// Look up a field: literal key first, then dotted path traversal.
pub(crate) fn lookup<'a>(source: &'a Value, field: &str) -> Option<&'a Value> {
    if let Some(value) = source.get(field) {
        return Some(value);
    }
    if field.contains('.') {
        let mut current = source;
        for part in field.split('.') {
            current = current.get(part)?;
        }
        return Some(current);
    }
    None
}

fn first_present<'a>(source: &'a Value, candidates: &[&str]) -> Option<&'a Value> {
    candidates
        .iter()
        .find_map(|field| lookup(source, field).filter(|v| !v.is_null()))
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(source: &Value, candidates: &[&str]) -> Option<String> {
    first_present(source, candidates).and_then(as_string)
}

fn numeric_field(source: &Value, candidates: &[&str]) -> Option<f64> {
    first_present(source, candidates).and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn timestamp_field(source: &Value, candidates: &[&str]) -> Option<DateTime<Utc>> {
    first_present(source, candidates).and_then(parse_timestamp)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn string_set(source: &Value, candidates: &[&str]) -> BTreeSet<String> {
    match first_present(source, candidates) {
        Some(Value::Array(items)) => items.iter().filter_map(as_string).collect(),
        Some(Value::String(s)) => BTreeSet::from([s.clone()]),
        _ => BTreeSet::new(),
    }
}

/// Parse one search hit into a security event.
///
/// Returns `None` for hits with no parseable timestamp; values that fail
/// the model validators are dropped to `None` field-by-field rather than
/// discarding the whole document.
pub fn parse_event(hit: &Value, indices: &[String]) -> Option<SecurityEvent> {
    let source = hit.get("_source")?;
    let id = hit
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    let timestamp = timestamp_field(source, TIMESTAMP_FIELDS)?;

    let source_ip = string_field(source, SOURCE_IP_FIELDS)
        .and_then(|s| validate_ip(&s).ok());
    let destination_ip = string_field(source, DESTINATION_IP_FIELDS)
        .and_then(|s| validate_ip(&s).ok());

    let source_port = numeric_field(source, SOURCE_PORT_FIELDS)
        .and_then(|p| validate_port("source_port", p as i64).ok());
    let destination_port = numeric_field(source, DESTINATION_PORT_FIELDS)
        .and_then(|p| validate_port("destination_port", p as i64).ok());

    let severity = string_field(source, SEVERITY_FIELDS)
        .and_then(|s| s.parse::<EventSeverity>().ok())
        .unwrap_or_default();
    let category = string_field(source, CATEGORY_FIELDS)
        .and_then(|s| s.parse::<EventCategory>().ok())
        .unwrap_or_default();

    let reputation_score =
        numeric_field(source, REPUTATION_FIELDS).filter(|score| (0.0..=100.0).contains(score));

    let event = SecurityEvent {
        id,
        timestamp,
        source_ip,
        destination_ip,
        source_port,
        destination_port,
        protocol: string_field(source, PROTOCOL_FIELDS),
        event_type: string_field(source, EVENT_TYPE_FIELDS).unwrap_or_else(|| "unknown".into()),
        severity,
        category,
        description: string_field(source, DESCRIPTION_FIELDS).unwrap_or_default(),
        country: string_field(source, COUNTRY_FIELDS),
        asn: string_field(source, ASN_FIELDS),
        organization: string_field(source, ORGANIZATION_FIELDS),
        reputation_score,
        attack_count: numeric_field(source, ATTACK_COUNT_FIELDS).map(|n| n as u64),
        first_seen: timestamp_field(source, FIRST_SEEN_FIELDS),
        last_seen: timestamp_field(source, LAST_SEEN_FIELDS),
        tags: string_set(source, TAG_FIELDS),
        attack_types: string_set(source, ATTACK_TYPE_FIELDS),
        raw_data: source.clone(),
        indices: indices.to_vec(),
    };

    debug_assert!(event.validate().is_ok());
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn indices() -> Vec<String> {
        vec!["dshield-2025.01".to_string()]
    }

    #[test]
    fn test_parse_nested_ecs_document() {
        let hit = json!({
            "_id": "abc123",
            "_source": {
                "@timestamp": "2025-01-01T00:00:00Z",
                "source": { "ip": "192.0.2.10", "port": 54321 },
                "destination": { "ip": "198.51.100.5", "port": 22 },
                "event": { "type": "connection", "category": "network", "severity": "high" },
                "network": { "protocol": "tcp" },
                "message": "ssh connection attempt",
                "tags": ["honeypot", "cowrie"]
            }
        });

        let event = parse_event(&hit, &indices()).expect("event should parse");
        assert_eq!(event.id, "abc123");
        assert_eq!(event.source_ip.expect("source ip").to_string(), "192.0.2.10");
        assert_eq!(event.destination_port, Some(22));
        assert_eq!(event.severity, EventSeverity::High);
        assert_eq!(event.category, EventCategory::Network);
        assert_eq!(event.protocol.as_deref(), Some("tcp"));
        assert_eq!(event.description, "ssh connection attempt");
        assert!(event.tags.contains("honeypot"));
        assert_eq!(event.indices, indices());
    }

    #[test]
    fn test_parse_flat_legacy_document() {
        let hit = json!({
            "_id": "legacy1",
            "_source": {
                "timestamp": "2025-01-01T12:00:00+00:00",
                "src_ip": "203.0.113.9",
                "dstport": "3389",
                "type": "rdp_scan",
                "severity": "low",
                "reputation": 85.5
            }
        });

        let event = parse_event(&hit, &indices()).expect("event should parse");
        assert_eq!(event.source_ip.expect("source ip").to_string(), "203.0.113.9");
        assert_eq!(event.destination_port, Some(3389));
        assert_eq!(event.event_type, "rdp_scan");
        assert_eq!(event.reputation_score, Some(85.5));
    }

    #[test]
    fn test_invalid_values_drop_to_none() {
        let hit = json!({
            "_id": "weird",
            "_source": {
                "@timestamp": "2025-01-01T00:00:00Z",
                "source": { "ip": "not-an-ip", "port": 0 },
                "reputation": 250
            }
        });

        let event = parse_event(&hit, &indices()).expect("event should parse");
        assert_eq!(event.source_ip, None);
        assert_eq!(event.source_port, None);
        assert_eq!(event.reputation_score, None);
    }

    #[test]
    fn test_missing_timestamp_rejects_hit() {
        let hit = json!({ "_id": "x", "_source": { "source": { "ip": "192.0.2.1" } } });
        assert!(parse_event(&hit, &indices()).is_none());
    }

    #[test]
    fn test_epoch_millis_timestamp() {
        let hit = json!({
            "_id": "epoch",
            "_source": { "@timestamp": 1735689600000i64 }
        });
        let event = parse_event(&hit, &indices()).expect("event should parse");
        assert_eq!(event.timestamp.timestamp_millis(), 1735689600000);
    }
}

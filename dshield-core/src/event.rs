//! Normalized security event model
//!
//! A `SecurityEvent` is produced by parsing one SIEM document. Events are
//! immutable after construction; the validators here are the single place
//! where the model's range invariants are enforced.

use crate::{EventCategory, EventSeverity, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// A normalized security event parsed from one SIEM document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unique event identifier (the backend document id).
    pub id: String,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Source IP address, if present in the document.
    pub source_ip: Option<IpAddr>,
    /// Destination IP address, if present in the document.
    pub destination_ip: Option<IpAddr>,
    /// Source port (1-65535).
    pub source_port: Option<u16>,
    /// Destination port (1-65535).
    pub destination_port: Option<u16>,
    /// Transport protocol.
    pub protocol: Option<String>,
    /// Type of security event (free text from the document).
    pub event_type: String,
    /// Event severity.
    pub severity: EventSeverity,
    /// Event category.
    pub category: EventCategory,
    /// Human-readable description.
    pub description: String,
    /// Country of origin.
    pub country: Option<String>,
    /// Autonomous system number.
    pub asn: Option<String>,
    /// Organization name.
    pub organization: Option<String>,
    /// Reputation score in [0, 100].
    pub reputation_score: Option<f64>,
    /// Number of attacks observed from this source.
    pub attack_count: Option<u64>,
    /// First seen timestamp.
    pub first_seen: Option<DateTime<Utc>>,
    /// Last seen timestamp.
    pub last_seen: Option<DateTime<Utc>>,
    /// Tags attached to the event.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Attack types observed.
    #[serde(default)]
    pub attack_types: BTreeSet<String>,
    /// The raw backend document.
    #[serde(default)]
    pub raw_data: serde_json::Value,
    /// Indices the document came from.
    #[serde(default)]
    pub indices: Vec<String>,
}

impl SecurityEvent {
    /// Check the model invariants: port and reputation ranges.
    ///
    /// IP validity is guaranteed by the `IpAddr` type; the remaining ranges
    /// are checked here so parsers can reject documents that violate them.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(port) = self.source_port {
            validate_port("source_port", i64::from(port))?;
        }
        if let Some(port) = self.destination_port {
            validate_port("destination_port", i64::from(port))?;
        }
        if let Some(score) = self.reputation_score {
            validate_reputation_score(score)?;
        }
        Ok(())
    }
}

/// Parse and validate an IP address string.
pub fn validate_ip(value: &str) -> Result<IpAddr, ValidationError> {
    value
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::InvalidIpAddress {
            value: value.to_string(),
        })
}

/// Validate a port number: must be in [1, 65535].
pub fn validate_port(field: &str, value: i64) -> Result<u16, ValidationError> {
    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value: value.to_string(),
            min: "1".to_string(),
            max: "65535".to_string(),
        })
    }
}

/// Validate a reputation score: must be in [0, 100].
pub fn validate_reputation_score(value: f64) -> Result<f64, ValidationError> {
    if (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange {
            field: "reputation_score".to_string(),
            value: value.to_string(),
            min: "0".to_string(),
            max: "100".to_string(),
        })
    }
}

/// Validate a domain name: must contain a dot and no whitespace.
pub fn validate_domain(value: &str) -> Result<&str, ValidationError> {
    let invalid = || ValidationError::InvalidDomain {
        value: value.to_string(),
    };
    if !value.contains('.')
        || value.contains(char::is_whitespace)
        || value.starts_with('.')
        || value.ends_with('.')
        || value.parse::<IpAddr>().is_ok()
    {
        return Err(invalid());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn minimal_event() -> SecurityEvent {
        SecurityEvent {
            id: "evt-1".to_string(),
            timestamp: Utc::now(),
            source_ip: None,
            destination_ip: None,
            source_port: None,
            destination_port: None,
            protocol: None,
            event_type: "attack".to_string(),
            severity: EventSeverity::Medium,
            category: EventCategory::Network,
            description: "test event".to_string(),
            country: None,
            asn: None,
            organization: None,
            reputation_score: None,
            attack_count: None,
            first_seen: None,
            last_seen: None,
            tags: BTreeSet::new(),
            attack_types: BTreeSet::new(),
            raw_data: serde_json::Value::Null,
            indices: vec![],
        }
    }

    #[test]
    fn test_port_boundaries() {
        assert!(validate_port("source_port", 1).is_ok());
        assert!(validate_port("source_port", 65535).is_ok());
        assert!(validate_port("source_port", 0).is_err());
        assert!(validate_port("source_port", 65536).is_err());
    }

    #[test]
    fn test_reputation_boundaries() {
        assert!(validate_reputation_score(0.0).is_ok());
        assert!(validate_reputation_score(100.0).is_ok());
        assert!(validate_reputation_score(-0.01).is_err());
        assert!(validate_reputation_score(100.01).is_err());
    }

    #[test]
    fn test_domain_validation() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("sub.example.co.uk").is_ok());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("has space.com").is_err());
        assert!(validate_domain("192.0.2.7").is_err());
        assert!(validate_domain(".example.com").is_err());
    }

    #[test]
    fn test_event_validate_checks_ranges() {
        let mut event = minimal_event();
        assert!(event.validate().is_ok());

        event.reputation_score = Some(101.0);
        assert!(event.validate().is_err());

        event.reputation_score = Some(50.0);
        event.source_port = Some(443);
        assert!(event.validate().is_ok());
    }

    proptest! {
        /// Any accepted IP string round-trips parse -> serialize -> parse.
        #[test]
        fn prop_ip_round_trip(a: u8, b: u8, c: u8, d: u8) {
            let text = format!("{}.{}.{}.{}", a, b, c, d);
            let parsed = validate_ip(&text).expect("dotted quad should parse");
            let reparsed = validate_ip(&parsed.to_string()).expect("serialized form should parse");
            prop_assert_eq!(parsed, reparsed);
        }

        /// Ports are accepted exactly on [1, 65535].
        #[test]
        fn prop_port_range(port in -1000i64..70000) {
            let ok = validate_port("destination_port", port).is_ok();
            prop_assert_eq!(ok, (1..=65535).contains(&port));
        }
    }
}

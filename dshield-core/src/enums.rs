//! Enum types for DShield MCP entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// EVENT ENUMS
// ============================================================================

/// Security event severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventSeverity::Low => "low",
            EventSeverity::Medium => "medium",
            EventSeverity::High => "high",
            EventSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EventSeverity {
    type Err = crate::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(EventSeverity::Low),
            "medium" => Ok(EventSeverity::Medium),
            "high" => Ok(EventSeverity::High),
            "critical" => Ok(EventSeverity::Critical),
            other => Err(crate::ValidationError::UnknownEnumValue {
                field: "severity".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Security event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Network,
    Authentication,
    Malware,
    Intrusion,
    DataExfiltration,
    Reconnaissance,
    DenialOfService,
    Attack,
    Block,
    Reputation,
    Geographic,
    Asn,
    Organization,
    Port,
    Protocol,
    #[default]
    Other,
}

impl FromStr for EventCategory {
    type Err = crate::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "network" => Ok(EventCategory::Network),
            "authentication" => Ok(EventCategory::Authentication),
            "malware" => Ok(EventCategory::Malware),
            "intrusion" => Ok(EventCategory::Intrusion),
            "data_exfiltration" => Ok(EventCategory::DataExfiltration),
            "reconnaissance" => Ok(EventCategory::Reconnaissance),
            "denial_of_service" => Ok(EventCategory::DenialOfService),
            "attack" => Ok(EventCategory::Attack),
            "block" => Ok(EventCategory::Block),
            "reputation" => Ok(EventCategory::Reputation),
            "geographic" => Ok(EventCategory::Geographic),
            "asn" => Ok(EventCategory::Asn),
            "organization" => Ok(EventCategory::Organization),
            "port" => Ok(EventCategory::Port),
            "protocol" => Ok(EventCategory::Protocol),
            _ => Ok(EventCategory::Other),
        }
    }
}

// ============================================================================
// THREAT INTELLIGENCE ENUMS
// ============================================================================

/// Threat intelligence source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSource {
    Dshield,
    Virustotal,
    Shodan,
    Abuseipdb,
    Alienvault,
    Threatfox,
}

impl ThreatSource {
    /// All sources the system knows about, in configuration order.
    ///
    /// This order is the tiebreak for weighted-voting conflicts during
    /// correlation, so it must stay stable.
    pub const ALL: [ThreatSource; 6] = [
        ThreatSource::Dshield,
        ThreatSource::Virustotal,
        ThreatSource::Shodan,
        ThreatSource::Abuseipdb,
        ThreatSource::Alienvault,
        ThreatSource::Threatfox,
    ];

    /// Default reliability weight for this source.
    pub fn default_reliability(self) -> f64 {
        match self {
            ThreatSource::Dshield => 0.8,
            ThreatSource::Virustotal => 0.9,
            ThreatSource::Shodan => 0.7,
            ThreatSource::Abuseipdb => 0.8,
            ThreatSource::Alienvault => 0.8,
            ThreatSource::Threatfox => 0.7,
        }
    }

    /// Stable label used as the persistent cache column and config key.
    pub fn label(self) -> &'static str {
        match self {
            ThreatSource::Dshield => "dshield",
            ThreatSource::Virustotal => "virustotal",
            ThreatSource::Shodan => "shodan",
            ThreatSource::Abuseipdb => "abuseipdb",
            ThreatSource::Alienvault => "alienvault",
            ThreatSource::Threatfox => "threatfox",
        }
    }
}

impl fmt::Display for ThreatSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Classification of a threat indicator string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    IpAddress,
    Domain,
    Hash,
    Cve,
    Generic,
}

impl IndicatorKind {
    /// Classify an indicator string by shape.
    ///
    /// Hashes are recognized by hex alphabet at MD5/SHA-1/SHA-256 lengths,
    /// CVEs by prefix, IPs by successful address parse, and domains by a
    /// dotted name that is not an address.
    pub fn classify(indicator: &str) -> IndicatorKind {
        let lower = indicator.to_lowercase();

        if lower.starts_with("cve-") {
            return IndicatorKind::Cve;
        }

        if matches!(lower.len(), 32 | 40 | 64) && lower.chars().all(|c| c.is_ascii_hexdigit()) {
            return IndicatorKind::Hash;
        }

        if lower.parse::<std::net::IpAddr>().is_ok() {
            return IndicatorKind::IpAddress;
        }

        if lower.contains('.') && !lower.contains(' ') {
            return IndicatorKind::Domain;
        }

        IndicatorKind::Generic
    }
}

// ============================================================================
// QUERY PIPELINE ENUMS
// ============================================================================

/// How aggressively the optimizer may degrade a query to fit the byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    /// Run the full degradation cascade.
    #[default]
    Auto,
    /// Execute the query exactly as requested.
    None,
}

/// Last-resort behavior when optimization cannot fit the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Replace documents with top-N aggregation summaries.
    #[default]
    Aggregate,
    /// Return a fixed-size sample plus the true total count.
    Sample,
    /// Return an empty, annotated result.
    None,
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FallbackStrategy::Aggregate => "aggregate",
            FallbackStrategy::Sample => "sample",
            FallbackStrategy::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_round_trip() {
        for s in ["low", "medium", "high", "critical"] {
            let parsed: EventSeverity = s.parse().expect("parse should succeed");
            assert_eq!(parsed.to_string(), s);
        }
        assert!("extreme".parse::<EventSeverity>().is_err());
    }

    #[test]
    fn test_category_unknown_maps_to_other() {
        let parsed: EventCategory = "weird".parse().expect("parse should succeed");
        assert_eq!(parsed, EventCategory::Other);
    }

    #[test]
    fn test_indicator_classification() {
        assert_eq!(IndicatorKind::classify("192.0.2.1"), IndicatorKind::IpAddress);
        assert_eq!(IndicatorKind::classify("2001:db8::1"), IndicatorKind::IpAddress);
        assert_eq!(IndicatorKind::classify("evil.example.com"), IndicatorKind::Domain);
        assert_eq!(
            IndicatorKind::classify("d41d8cd98f00b204e9800998ecf8427e"),
            IndicatorKind::Hash
        );
        assert_eq!(
            IndicatorKind::classify(&"a".repeat(64)),
            IndicatorKind::Hash
        );
        assert_eq!(IndicatorKind::classify("CVE-2024-3094"), IndicatorKind::Cve);
        assert_eq!(IndicatorKind::classify("ssh-bruteforce"), IndicatorKind::Generic);
    }

    #[test]
    fn test_source_labels_are_stable() {
        for source in ThreatSource::ALL {
            let json = serde_json::to_string(&source).expect("serialize should succeed");
            assert_eq!(json, format!("\"{}\"", source.label()));
        }
    }
}

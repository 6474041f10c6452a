//! Threat intelligence result model
//!
//! Aggregated verdicts produced by the enrichment orchestrator, plus the
//! normalized per-source response shape every provider client returns.

use crate::{IndicatorKind, ThreatSource, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized response from one threat intelligence provider.
///
/// Providers map their wire formats onto this shape; fields a provider does
/// not report stay `None` and read as "no signal" during correlation. In
/// particular a missing score must never be coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SourceResult {
    /// Threat score in [0, 100], higher is worse.
    pub threat_score: Option<f64>,
    /// Reputation score in [0, 100], higher is better.
    pub reputation_score: Option<f64>,
    /// Provider confidence in [0, 1].
    pub confidence: Option<f64>,
    /// Country of the indicator.
    pub country: Option<String>,
    /// Region of the indicator.
    pub region: Option<String>,
    /// City of the indicator.
    pub city: Option<String>,
    /// Autonomous system number.
    pub asn: Option<String>,
    /// Organization name.
    pub organization: Option<String>,
    /// Internet service provider.
    pub isp: Option<String>,
    /// Earliest observation by this provider.
    pub first_seen: Option<DateTime<Utc>>,
    /// Latest observation by this provider.
    pub last_seen: Option<DateTime<Utc>>,
    /// Attack types reported.
    #[serde(default)]
    pub attack_types: Vec<String>,
    /// Tags reported.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form indicators reported.
    #[serde(default)]
    pub indicators: Vec<String>,
    /// IPs a domain resolves to (domain lookups only).
    #[serde(default)]
    pub resolved_ips: Vec<String>,
    /// Authoritative nameservers (domain lookups only).
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// Registrar name (domain lookups only).
    pub registrar: Option<String>,
    /// Domain creation date (domain lookups only).
    pub creation_date: Option<DateTime<Utc>>,
    /// Raw provider response for audit.
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// One correlated threat indicator surviving the confidence threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatIndicator {
    /// The indicator string, lowercased.
    pub indicator: String,
    /// Shape-based classification.
    pub kind: IndicatorKind,
    /// Number of reports across all sources.
    pub count: usize,
    /// Sources that reported this indicator.
    pub sources: Vec<ThreatSource>,
    /// Reliability-weighted confidence in [0, 1].
    pub confidence: f64,
    /// Number of distinct reporting sources.
    pub source_count: usize,
}

/// Quality metrics for a correlation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CorrelationMetrics {
    /// Number of sources that returned a usable result.
    pub source_count: usize,
    /// Number of indicators surviving the confidence threshold.
    pub indicator_count: usize,
    /// Fraction of configured enabled sources that answered, in [0, 1].
    pub data_completeness: f64,
    /// Variance of per-source threat scores; 0 when fewer than two scored.
    pub threat_score_variance: f64,
}

/// Aggregated threat intelligence verdict for one IP address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatIntelligenceResult {
    /// The enriched IP address.
    pub ip_address: String,
    /// Reliability-weighted threat score in [0, 100]; `None` when no source
    /// provided a score.
    pub overall_threat_score: Option<f64>,
    /// Reliability-weighted confidence in [0, 1].
    pub confidence_score: Option<f64>,
    /// Raw per-source results keyed by source.
    #[serde(default)]
    pub source_results: BTreeMap<ThreatSource, SourceResult>,
    /// Correlated indicators sorted by (confidence desc, source count desc).
    #[serde(default)]
    pub threat_indicators: Vec<ThreatIndicator>,
    /// Winning geographic values per field (country, region, city).
    #[serde(default)]
    pub geographic_data: BTreeMap<String, String>,
    /// Winning network values per field (asn, organization, isp).
    #[serde(default)]
    pub network_data: BTreeMap<String, String>,
    /// Earliest first-seen across sources.
    pub first_seen: Option<DateTime<Utc>>,
    /// Latest last-seen across sources.
    pub last_seen: Option<DateTime<Utc>>,
    /// Sources that answered this query.
    #[serde(default)]
    pub sources_queried: Vec<ThreatSource>,
    /// When the query ran.
    pub query_timestamp: DateTime<Utc>,
    /// Whether this result came from cache.
    #[serde(default)]
    pub cache_hit: bool,
    /// Correlation quality metrics.
    pub correlation_metrics: Option<CorrelationMetrics>,
}

impl ThreatIntelligenceResult {
    /// Create an empty result for an address, stamped now.
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            overall_threat_score: None,
            confidence_score: None,
            source_results: BTreeMap::new(),
            threat_indicators: Vec::new(),
            geographic_data: BTreeMap::new(),
            network_data: BTreeMap::new(),
            first_seen: None,
            last_seen: None,
            sources_queried: Vec::new(),
            query_timestamp: Utc::now(),
            cache_hit: false,
            correlation_metrics: None,
        }
    }

    /// Check the score-range invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(score) = self.overall_threat_score {
            if !(0.0..=100.0).contains(&score) {
                return Err(ValidationError::InvalidValue {
                    field: "overall_threat_score".to_string(),
                    reason: format!("{} outside [0, 100]", score),
                });
            }
        }
        if let Some(confidence) = self.confidence_score {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ValidationError::InvalidValue {
                    field: "confidence_score".to_string(),
                    reason: format!("{} outside [0, 1]", confidence),
                });
            }
        }
        Ok(())
    }
}

/// Aggregated threat intelligence verdict for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainIntelligence {
    /// The enriched domain name.
    pub domain: String,
    /// Reliability-weighted threat score in [0, 100].
    pub threat_score: Option<f64>,
    /// Reputation score in [0, 100].
    pub reputation_score: Option<f64>,
    /// IP addresses the domain resolves to.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    /// Authoritative nameservers.
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// Registrar name.
    pub registrar: Option<String>,
    /// Domain creation date.
    pub creation_date: Option<DateTime<Utc>>,
    /// Threat categories.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Tags reported by sources.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Raw per-source results keyed by source.
    #[serde(default)]
    pub source_results: BTreeMap<ThreatSource, SourceResult>,
    /// Sources that answered this query.
    #[serde(default)]
    pub sources_queried: Vec<ThreatSource>,
    /// When the query ran.
    pub query_timestamp: DateTime<Utc>,
    /// Whether this result came from cache.
    #[serde(default)]
    pub cache_hit: bool,
}

impl DomainIntelligence {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            threat_score: None,
            reputation_score: None,
            ip_addresses: Vec::new(),
            nameservers: Vec::new(),
            registrar: None,
            creation_date: None,
            categories: Vec::new(),
            tags: Vec::new(),
            source_results: BTreeMap::new(),
            sources_queried: Vec::new(),
            query_timestamp: Utc::now(),
            cache_hit: false,
        }
    }
}

/// One entry in an indicator correlation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedIndicator {
    /// The indicator string, lowercased.
    pub indicator: String,
    /// Shape-based classification.
    pub kind: IndicatorKind,
    /// How many times the indicator appeared in the input.
    pub count: usize,
}

/// Result of correlating a batch of indicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorCorrelation {
    /// Correlation identifier.
    pub correlation_id: String,
    /// Deduplicated, classified indicator entries.
    pub indicators: Vec<ClassifiedIndicator>,
    /// When the correlation ran.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_validate() {
        let mut result = ThreatIntelligenceResult::new("192.0.2.1");
        assert!(result.validate().is_ok());

        result.overall_threat_score = Some(71.25);
        result.confidence_score = Some(0.8);
        assert!(result.validate().is_ok());

        result.overall_threat_score = Some(100.5);
        assert!(result.validate().is_err());

        result.overall_threat_score = Some(50.0);
        result.confidence_score = Some(1.5);
        assert!(result.validate().is_err());
    }

    #[test]
    fn test_source_result_default_has_no_signal() {
        let result = SourceResult::default();
        assert!(result.threat_score.is_none());
        assert!(result.reputation_score.is_none());
        assert!(result.confidence.is_none());
    }

    #[test]
    fn test_result_serde_round_trip() {
        let mut result = ThreatIntelligenceResult::new("198.51.100.7");
        result.sources_queried = vec![ThreatSource::Dshield, ThreatSource::Virustotal];
        result.source_results.insert(
            ThreatSource::Dshield,
            SourceResult {
                threat_score: Some(42.0),
                confidence: Some(0.8),
                ..Default::default()
            },
        );

        let json = serde_json::to_string(&result).expect("serialize should succeed");
        let back: ThreatIntelligenceResult =
            serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, result);
    }
}

//! Threat intelligence provider clients
//!
//! Each provider implements the [`IntelSource`] trait and maps its wire
//! format onto the normalized [`SourceResult`] shape. The orchestrator
//! iterates over a registry of these without knowing the implementations.

pub mod abuseipdb;
pub mod alienvault;
pub mod dshield;
pub mod shodan;
pub mod threatfox;
pub mod virustotal;

pub use abuseipdb::AbuseIpdbClient;
pub use alienvault::AlienVaultClient;
pub use dshield::DshieldClient;
pub use shodan::ShodanClient;
pub use threatfox::ThreatFoxClient;
pub use virustotal::VirusTotalClient;

use async_trait::async_trait;
use dshield_core::{DshieldResult, SourceResult, ThreatIntelConfig, ThreatSource};
use std::sync::Arc;
use std::time::Duration;

/// One threat intelligence source.
#[async_trait]
pub trait IntelSource: Send + Sync {
    /// Which source this is.
    fn name(&self) -> ThreatSource;

    /// Reliability weight in [0, 1].
    fn reliability(&self) -> f64;

    /// Whether the source can answer domain lookups.
    fn supports_domains(&self) -> bool {
        false
    }

    /// Look up reputation data for an IP address.
    async fn ip_reputation(&self, ip: &str) -> DshieldResult<SourceResult>;

    /// Look up a domain report.
    async fn domain_report(&self, domain: &str) -> DshieldResult<SourceResult> {
        let _ = domain;
        Err(dshield_core::DshieldError::external(
            self.name().label(),
            "domain lookups not supported by this source",
        ))
    }
}

/// Build an HTTP client with the per-source timeout.
pub(crate) fn http_client(timeout_seconds: u64) -> DshieldResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .build()
        .map_err(|e| dshield_core::DshieldError::internal(format!("http client: {}", e)))
}

/// Build the provider registry from configuration, enabled sources only.
pub fn build_registry(config: &ThreatIntelConfig) -> DshieldResult<Vec<Arc<dyn IntelSource>>> {
    let mut registry: Vec<Arc<dyn IntelSource>> = Vec::new();

    for source in config.enabled_sources() {
        let source_config = config.source(source);
        let reliability = config.reliability(source);
        let provider: Arc<dyn IntelSource> = match source {
            ThreatSource::Dshield => Arc::new(DshieldClient::new(&source_config, reliability)?),
            ThreatSource::Virustotal => {
                Arc::new(VirusTotalClient::new(&source_config, reliability)?)
            }
            ThreatSource::Shodan => Arc::new(ShodanClient::new(&source_config, reliability)?),
            ThreatSource::Abuseipdb => {
                Arc::new(AbuseIpdbClient::new(&source_config, reliability)?)
            }
            ThreatSource::Alienvault => {
                Arc::new(AlienVaultClient::new(&source_config, reliability)?)
            }
            ThreatSource::Threatfox => {
                Arc::new(ThreatFoxClient::new(&source_config, reliability)?)
            }
        };
        registry.push(provider);
    }

    tracing::info!(
        sources = ?registry.iter().map(|p| p.name().label()).collect::<Vec<_>>(),
        "threat intelligence registry built"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dshield_core::SourceConfig;

    #[test]
    fn test_registry_contains_only_enabled_sources() {
        let mut config = ThreatIntelConfig::default();
        config.sources.insert(
            "dshield".to_string(),
            SourceConfig {
                enabled: true,
                ..Default::default()
            },
        );
        config.sources.insert(
            "shodan".to_string(),
            SourceConfig {
                enabled: false,
                ..Default::default()
            },
        );

        let registry = build_registry(&config).expect("registry should build");
        let names: Vec<ThreatSource> = registry.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec![ThreatSource::Dshield]);
    }
}

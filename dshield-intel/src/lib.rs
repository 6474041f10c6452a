//! DShield MCP threat intelligence orchestrator
//!
//! Fans one indicator out to every enabled provider under per-source rate
//! and concurrency budgets, correlates the answers with reliability
//! weighting, caches the verdict in the two-tier cache, and optionally
//! writes it back into the SIEM.

mod correlate;
pub mod providers;
mod rate_limit;

pub use correlate::{correlate, Reliabilities};
pub use providers::{build_registry, IntelSource};
pub use rate_limit::SourceBudget;

use chrono::Utc;
use dshield_cache::{CacheStatistics, TieredCache};
use dshield_core::{
    validate_domain, validate_ip, ClassifiedIndicator, DomainIntelligence, DshieldError,
    DshieldResult, IndicatorCorrelation, IndicatorKind, SourceResult, ThreatIntelConfig,
    ThreatIntelligenceResult, ThreatSource,
};
use dshield_siem::SearchBackend;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Cache source label for aggregated IP verdicts.
const IP_CACHE_LABEL: &str = "comprehensive_ip";

/// Cache source label for aggregated domain verdicts.
const DOMAIN_CACHE_LABEL: &str = "comprehensive_domain";

/// Writeback destination, when enabled.
struct Writeback {
    backend: Arc<dyn SearchBackend>,
    index_prefix: String,
    dedup_by_day: bool,
}

/// Status of one source, for the diagnostics surface.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SourceStatus {
    pub source: ThreatSource,
    pub reliability: f64,
    pub supports_domains: bool,
    pub requests_in_window: usize,
    pub available_permits: usize,
}

/// The threat intelligence orchestrator.
pub struct ThreatIntelManager {
    registry: Vec<Arc<dyn IntelSource>>,
    budgets: BTreeMap<ThreatSource, Arc<SourceBudget>>,
    source_timeouts: BTreeMap<ThreatSource, Duration>,
    reliabilities: Reliabilities,
    confidence_threshold: f64,
    cache: Arc<TieredCache>,
    writeback: Option<Writeback>,
}

impl ThreatIntelManager {
    /// Assemble the orchestrator from configuration and a provider registry.
    ///
    /// `writeback_backend` is the SIEM client used for verdict writeback;
    /// pass `None` when writeback is disabled in configuration.
    pub fn new(
        config: &ThreatIntelConfig,
        registry: Vec<Arc<dyn IntelSource>>,
        cache: Arc<TieredCache>,
        writeback_backend: Option<Arc<dyn SearchBackend>>,
    ) -> Self {
        let mut budgets = BTreeMap::new();
        let mut source_timeouts = BTreeMap::new();
        let mut reliabilities = Reliabilities::new();

        for provider in &registry {
            let source = provider.name();
            let source_config = config.source(source);
            budgets.insert(
                source,
                Arc::new(SourceBudget::new(
                    source,
                    source_config.rate_limit_requests_per_minute,
                    source_config.concurrency_limit,
                    source_config.max_backoff_attempts,
                )),
            );
            source_timeouts.insert(source, Duration::from_secs(source_config.timeout_seconds));
            reliabilities.insert(source, provider.reliability());
        }

        let writeback = writeback_backend.and_then(|backend| {
            config.elasticsearch.writeback_enabled.then(|| Writeback {
                backend,
                index_prefix: config.elasticsearch.index_prefix.clone(),
                dedup_by_day: config.elasticsearch.dedup_by_day,
            })
        });

        Self {
            registry,
            budgets,
            source_timeouts,
            reliabilities,
            confidence_threshold: config.correlation.confidence_threshold,
            cache,
            writeback,
        }
    }

    /// Build the orchestrator with the default provider registry.
    pub fn from_config(
        config: &ThreatIntelConfig,
        cache: Arc<TieredCache>,
        writeback_backend: Option<Arc<dyn SearchBackend>>,
    ) -> DshieldResult<Self> {
        let registry = build_registry(config)?;
        Ok(Self::new(config, registry, cache, writeback_backend))
    }

    /// Enrich one IP address across all enabled sources.
    pub async fn enrich_ip(&self, ip_address: &str) -> DshieldResult<ThreatIntelligenceResult> {
        let ip = validate_ip(ip_address)?;
        let ip_text = ip.to_string();

        if let Some((mut cached, tier)) = self
            .cache
            .get::<ThreatIntelligenceResult>(&ip_text, IP_CACHE_LABEL)?
        {
            tracing::debug!(ip = %ip_text, ?tier, "ip enrichment served from cache");
            cached.cache_hit = true;
            return Ok(cached);
        }

        let source_results = self
            .fan_out(&ip_text, |provider, indicator| async move {
                provider.ip_reputation(&indicator).await
            })
            .await?;

        let mut result = ThreatIntelligenceResult::new(ip_text.clone());
        result.sources_queried = source_results.keys().copied().collect();
        result.source_results = source_results;
        correlate(
            &mut result,
            &self.reliabilities,
            self.confidence_threshold,
            self.registry.len(),
        );
        debug_assert!(result.validate().is_ok());

        if let Err(err) = self
            .cache
            .put(&ip_text, IP_CACHE_LABEL, &result, result.query_timestamp)
        {
            tracing::warn!(error = %err, ip = %ip_text, "failed to cache enrichment result");
        }

        self.write_back(&result).await;

        tracing::info!(
            ip = %ip_text,
            sources = result.sources_queried.len(),
            threat_score = ?result.overall_threat_score,
            "ip enrichment complete"
        );
        Ok(result)
    }

    /// Enrich one domain across sources that support domain lookups.
    pub async fn enrich_domain(&self, domain: &str) -> DshieldResult<DomainIntelligence> {
        let domain = validate_domain(domain)?.to_lowercase();

        if let Some((mut cached, tier)) = self
            .cache
            .get::<DomainIntelligence>(&domain, DOMAIN_CACHE_LABEL)?
        {
            tracing::debug!(domain = %domain, ?tier, "domain enrichment served from cache");
            cached.cache_hit = true;
            return Ok(cached);
        }

        let capable: Vec<Arc<dyn IntelSource>> = self
            .registry
            .iter()
            .filter(|p| p.supports_domains())
            .cloned()
            .collect();
        if capable.is_empty() {
            return Err(DshieldError::external(
                "threat_intelligence",
                "no enabled source supports domain lookups",
            ));
        }

        let source_results = self
            .fan_out_over(&capable, &domain, |provider, indicator| async move {
                provider.domain_report(&indicator).await
            })
            .await?;

        let result = self.aggregate_domain(domain.clone(), source_results);

        if let Err(err) =
            self.cache
                .put(&domain, DOMAIN_CACHE_LABEL, &result, result.query_timestamp)
        {
            tracing::warn!(error = %err, domain = %domain, "failed to cache domain result");
        }

        tracing::info!(
            domain = %domain,
            sources = result.sources_queried.len(),
            threat_score = ?result.threat_score,
            "domain enrichment complete"
        );
        Ok(result)
    }

    /// Classify and deduplicate a batch of indicators.
    pub async fn correlate_indicators(
        &self,
        indicators: &[String],
    ) -> DshieldResult<IndicatorCorrelation> {
        if indicators.is_empty() {
            return Err(dshield_core::ValidationError::RequiredFieldMissing {
                field: "indicators".to_string(),
            }
            .into());
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for indicator in indicators {
            *counts.entry(indicator.to_lowercase()).or_default() += 1;
        }

        let classified: Vec<ClassifiedIndicator> = counts
            .into_iter()
            .map(|(indicator, count)| ClassifiedIndicator {
                kind: IndicatorKind::classify(&indicator),
                indicator,
                count,
            })
            .collect();

        Ok(IndicatorCorrelation {
            correlation_id: format!("corr_{}", uuid::Uuid::new_v4().simple()),
            indicators: classified,
            timestamp: Utc::now(),
        })
    }

    /// Fan an indicator out to the full registry.
    async fn fan_out<F, Fut>(
        &self,
        indicator: &str,
        query: F,
    ) -> DshieldResult<BTreeMap<ThreatSource, SourceResult>>
    where
        F: Fn(Arc<dyn IntelSource>, String) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = DshieldResult<SourceResult>> + Send + 'static,
    {
        let registry = self.registry.clone();
        self.fan_out_over(&registry, indicator, query).await
    }

    /// Fan an indicator out to a subset of providers.
    ///
    /// Each task acquires the source's concurrency permit, waits out the
    /// rate window, then queries under the per-source timeout. Failed and
    /// timed-out sources are logged and excluded; the fan-out only fails
    /// when no source succeeds.
    async fn fan_out_over<F, Fut>(
        &self,
        providers: &[Arc<dyn IntelSource>],
        indicator: &str,
        query: F,
    ) -> DshieldResult<BTreeMap<ThreatSource, SourceResult>>
    where
        F: Fn(Arc<dyn IntelSource>, String) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = DshieldResult<SourceResult>> + Send + 'static,
    {
        if providers.is_empty() {
            return Err(DshieldError::external(
                "threat_intelligence",
                "no threat intelligence sources enabled",
            ));
        }

        let mut tasks: JoinSet<(ThreatSource, DshieldResult<SourceResult>)> = JoinSet::new();

        for provider in providers {
            let source = provider.name();
            let budget = self
                .budgets
                .get(&source)
                .cloned()
                .expect("budget exists for every registered source");
            let timeout = self
                .source_timeouts
                .get(&source)
                .copied()
                .unwrap_or(Duration::from_secs(30));
            let provider = provider.clone();
            let indicator = indicator.to_string();
            let query = query.clone();

            tasks.spawn(async move {
                let outcome = async {
                    // Permit is held for the duration of the call and
                    // released on every exit path, including cancellation.
                    let _permit = budget.acquire().await?;
                    match tokio::time::timeout(timeout, query(provider, indicator)).await {
                        Ok(result) => result,
                        Err(_) => Err(DshieldError::timeout(source.label(), timeout)),
                    }
                }
                .await;
                (source, outcome)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source, Ok(result))) => {
                    results.insert(source, result);
                }
                Ok((source, Err(err))) => {
                    tracing::warn!(source = %source, error = %err, "source query failed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "source task panicked or was cancelled");
                }
            }
        }

        if results.is_empty() {
            return Err(DshieldError::external(
                "threat_intelligence",
                "all threat intelligence sources failed",
            ));
        }
        Ok(results)
    }

    /// Fold per-source domain answers into one `DomainIntelligence`.
    fn aggregate_domain(
        &self,
        domain: String,
        source_results: BTreeMap<ThreatSource, SourceResult>,
    ) -> DomainIntelligence {
        let mut result = DomainIntelligence::new(domain);
        result.sources_queried = source_results.keys().copied().collect();

        let mut threat_num = 0.0;
        let mut threat_den = 0.0;
        let mut rep_num = 0.0;
        let mut rep_den = 0.0;

        for (source, sr) in &source_results {
            let reliability = self
                .reliabilities
                .get(source)
                .copied()
                .unwrap_or_else(|| source.default_reliability());

            if let Some(score) = sr.threat_score {
                threat_num += score * reliability;
                threat_den += reliability;
            }
            if let Some(score) = sr.reputation_score {
                rep_num += score * reliability;
                rep_den += reliability;
            }

            for ip in &sr.resolved_ips {
                if !result.ip_addresses.contains(ip) {
                    result.ip_addresses.push(ip.clone());
                }
            }
            for ns in &sr.nameservers {
                if !result.nameservers.contains(ns) {
                    result.nameservers.push(ns.clone());
                }
            }
            for category in &sr.attack_types {
                if !result.categories.contains(category) {
                    result.categories.push(category.clone());
                }
            }
            for tag in &sr.tags {
                if !result.tags.contains(tag) {
                    result.tags.push(tag.clone());
                }
            }
            if result.registrar.is_none() {
                result.registrar = sr.registrar.clone();
            }
            result.creation_date = match (result.creation_date, sr.creation_date) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        result.threat_score = (threat_den > 0.0).then(|| threat_num / threat_den);
        result.reputation_score = (rep_den > 0.0).then(|| rep_num / rep_den);
        result.source_results = source_results;
        result
    }

    /// Best-effort writeback of a correlated verdict into the SIEM.
    ///
    /// Failures are logged and never surfaced to the caller.
    async fn write_back(&self, result: &ThreatIntelligenceResult) {
        let Some(writeback) = &self.writeback else {
            return;
        };

        let index = format!(
            "{}-{}",
            writeback.index_prefix,
            result.query_timestamp.format("%Y.%m")
        );
        let id = if writeback.dedup_by_day {
            format!("{}_{}", result.ip_address, result.query_timestamp.format("%Y.%m.%d"))
        } else {
            format!("{}_{}", result.ip_address, result.query_timestamp.to_rfc3339())
        };

        let document = json!({
            "indicator": result.ip_address,
            "indicator_type": "ip",
            "sources": result.sources_queried,
            "asn": result.network_data.get("asn"),
            "geo": result.geographic_data,
            "tags": result
                .threat_indicators
                .iter()
                .map(|i| i.kind)
                .collect::<Vec<_>>(),
            "timestamp": result.query_timestamp.to_rfc3339(),
            "threat_score": result.overall_threat_score,
            "confidence_score": result.confidence_score,
        });

        if let Err(err) = writeback
            .backend
            .index_document(&index, &id, &document)
            .await
        {
            tracing::warn!(error = %err, index = %index, "enrichment writeback failed");
        }
    }

    /// Per-source status for the diagnostics surface.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        self.registry
            .iter()
            .map(|provider| {
                let source = provider.name();
                let budget = self.budgets.get(&source);
                SourceStatus {
                    source,
                    reliability: provider.reliability(),
                    supports_domains: provider.supports_domains(),
                    requests_in_window: budget.map(|b| b.in_flight_window()).unwrap_or(0),
                    available_permits: budget.map(|b| b.available_permits()).unwrap_or(0),
                }
            })
            .collect()
    }

    /// Cache statistics passthrough.
    pub fn cache_statistics(&self) -> DshieldResult<CacheStatistics> {
        self.cache.statistics()
    }

    /// Purge expired persistent cache rows; the janitor entry point.
    pub fn purge_expired_cache(&self) -> DshieldResult<u64> {
        self.cache.purge_expired()
    }

    /// Drop the memory cache tier.
    pub fn clear_memory_cache(&self) {
        self.cache.clear_memory();
    }
}

impl std::fmt::Debug for ThreatIntelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatIntelManager")
            .field(
                "sources",
                &self.registry.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("confidence_threshold", &self.confidence_threshold)
            .field("writeback_enabled", &self.writeback.is_some())
            .finish()
    }
}

//! ThreatFox client

use super::{http_client, IntelSource};
use async_trait::async_trait;
use dshield_core::{DshieldError, DshieldResult, SourceConfig, SourceResult, ThreatSource};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://threatfox-api.abuse.ch/api/v1";
const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Client for the abuse.ch ThreatFox IOC API.
pub struct ThreatFoxClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    reliability: f64,
}

impl ThreatFoxClient {
    pub fn new(config: &SourceConfig, reliability: f64) -> DshieldResult<Self> {
        Ok(Self {
            http: http_client(config.timeout_seconds)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: config.api_key.clone(),
            reliability,
        })
    }

    async fn search(&self, term: &str) -> DshieldResult<Value> {
        let mut request = self
            .http
            .post(&self.base_url)
            .json(&json!({ "query": "search_ioc", "search_term": term }));
        if let Some(key) = &self.api_key {
            request = request.header("Auth-Key", key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DshieldError::external("threatfox", e.to_string()))?;
        if !response.status().is_success() {
            return Err(DshieldError::external(
                "threatfox",
                format!("status {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| DshieldError::external("threatfox", e.to_string()))
    }

    fn parse_search(body: &Value) -> SourceResult {
        // "no_result" is a valid answer meaning no IOCs reference the term
        if body["query_status"] == "no_result" {
            return SourceResult {
                confidence: Some(DEFAULT_CONFIDENCE),
                raw: body.clone(),
                ..Default::default()
            };
        }

        let entries = body["data"].as_array().cloned().unwrap_or_default();

        // The strongest IOC confidence drives the score
        let threat_score = entries
            .iter()
            .filter_map(|entry| entry["confidence_level"].as_f64())
            .fold(None::<f64>, |best, level| {
                Some(best.map_or(level, |b| b.max(level)))
            })
            .map(|level| level.clamp(0.0, 100.0));

        let mut malware: Vec<String> = Vec::new();
        let mut threat_types: Vec<String> = Vec::new();
        for entry in &entries {
            if let Some(name) = entry["malware_printable"].as_str() {
                if !malware.iter().any(|m| m == name) {
                    malware.push(name.to_string());
                }
            }
            if let Some(threat_type) = entry["threat_type"].as_str() {
                if !threat_types.iter().any(|t| t == threat_type) {
                    threat_types.push(threat_type.to_string());
                }
            }
        }

        let first_seen = entries
            .iter()
            .filter_map(|entry| parse_utc(entry["first_seen"].as_str()))
            .min();
        let last_seen = entries
            .iter()
            .filter_map(|entry| {
                parse_utc(entry["last_seen"].as_str())
                    .or_else(|| parse_utc(entry["first_seen"].as_str()))
            })
            .max();

        SourceResult {
            threat_score,
            confidence: Some(DEFAULT_CONFIDENCE),
            first_seen,
            last_seen,
            indicators: malware,
            attack_types: threat_types,
            raw: body.clone(),
            ..Default::default()
        }
    }
}

fn parse_utc(text: Option<&str>) -> Option<chrono::DateTime<chrono::Utc>> {
    let text = text?;
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S UTC")
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&chrono::Utc))
        })
}

#[async_trait]
impl IntelSource for ThreatFoxClient {
    fn name(&self) -> ThreatSource {
        ThreatSource::Threatfox
    }

    fn reliability(&self) -> f64 {
        self.reliability
    }

    fn supports_domains(&self) -> bool {
        true
    }

    async fn ip_reputation(&self, ip: &str) -> DshieldResult<SourceResult> {
        let body = self.search(ip).await?;
        Ok(Self::parse_search(&body))
    }

    async fn domain_report(&self, domain: &str) -> DshieldResult<SourceResult> {
        let body = self.search(domain).await?;
        Ok(Self::parse_search(&body))
    }
}

impl std::fmt::Debug for ThreatFoxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatFoxClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

//! VirusTotal client

use super::{http_client, IntelSource};
use async_trait::async_trait;
use dshield_core::{DshieldError, DshieldResult, SourceConfig, SourceResult, ThreatSource};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://www.virustotal.com/api/v3";
const DEFAULT_CONFIDENCE: f64 = 0.9;

/// Client for the VirusTotal v3 API.
pub struct VirusTotalClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    reliability: f64,
}

impl VirusTotalClient {
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

    async fn fetch(&self, path: &str) -> DshieldResult<Value> {
        let key = self.api_key.as_ref().ok_or_else(|| {
            DshieldError::external("virustotal", "api key not configured")
        })?;

        let response = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .header("x-apikey", key.expose_secret())
            .send()
            .await
            .map_err(|e| DshieldError::external("virustotal", e.to_string()))?;

        if !response.status().is_success() {
            return Err(DshieldError::external(
                "virustotal",
                format!("status {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| DshieldError::external("virustotal", e.to_string()))
    }

    /// Threat score from analysis stats: share of engines flagging the
    /// object, suspicious verdicts at half weight.
    fn score_from_stats(stats: &Value) -> Option<f64> {
        let malicious = stats.get("malicious")?.as_f64()?;
        let suspicious = stats.get("suspicious").and_then(Value::as_f64).unwrap_or(0.0);
        let harmless = stats.get("harmless").and_then(Value::as_f64).unwrap_or(0.0);
        let undetected = stats.get("undetected").and_then(Value::as_f64).unwrap_or(0.0);

        let total = malicious + suspicious + harmless + undetected;
        if total == 0.0 {
            return None;
        }
        Some(((malicious + suspicious * 0.5) / total * 100.0).clamp(0.0, 100.0))
    }

    fn parse_object(body: &Value) -> SourceResult {
        let attributes = &body["data"]["attributes"];

        let threat_score = Self::score_from_stats(&attributes["last_analysis_stats"]);
        let tags = attributes["tags"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        SourceResult {
            threat_score,
            confidence: Some(DEFAULT_CONFIDENCE),
            country: attributes["country"].as_str().map(str::to_string),
            asn: attributes["asn"].as_u64().map(|n| n.to_string()),
            organization: attributes["as_owner"].as_str().map(str::to_string),
            registrar: attributes["registrar"].as_str().map(str::to_string),
            creation_date: attributes["creation_date"]
                .as_i64()
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
            nameservers: attributes["last_dns_records"]
                .as_array()
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| r["type"] == "NS")
                        .filter_map(|r| r["value"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            resolved_ips: attributes["last_dns_records"]
                .as_array()
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| r["type"] == "A" || r["type"] == "AAAA")
                        .filter_map(|r| r["value"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            tags,
            raw: body.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IntelSource for VirusTotalClient {
    fn name(&self) -> ThreatSource {
        ThreatSource::Virustotal
    }

    fn reliability(&self) -> f64 {
        self.reliability
    }

    fn supports_domains(&self) -> bool {
        true
    }

    async fn ip_reputation(&self, ip: &str) -> DshieldResult<SourceResult> {
        let body = self.fetch(&format!("ip_addresses/{}", ip)).await?;
        Ok(Self::parse_object(&body))
    }

    async fn domain_report(&self, domain: &str) -> DshieldResult<SourceResult> {
        let body = self.fetch(&format!("domains/{}", domain)).await?;
        Ok(Self::parse_object(&body))
    }
}

impl std::fmt::Debug for VirusTotalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirusTotalClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

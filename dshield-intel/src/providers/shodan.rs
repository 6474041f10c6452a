//! Shodan client

use super::{http_client, IntelSource};
use async_trait::async_trait;
use dshield_core::{DshieldError, DshieldResult, SourceConfig, SourceResult, ThreatSource};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://api.shodan.io";
const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Client for the Shodan host API.
pub struct ShodanClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    reliability: f64,
}

impl ShodanClient {
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

    fn parse_host(body: &Value) -> SourceResult {
        let vulns: Vec<String> = body["vulns"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        // Exposure-based score: each known vulnerability weighs 15 points
        let threat_score = if vulns.is_empty() {
            None
        } else {
            Some(((vulns.len() as f64) * 15.0).min(100.0))
        };

        let tags = body["tags"]
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
            country: body["country_name"].as_str().map(str::to_string),
            city: body["city"].as_str().map(str::to_string),
            asn: body["asn"].as_str().map(str::to_string),
            organization: body["org"].as_str().map(str::to_string),
            isp: body["isp"].as_str().map(str::to_string),
            last_seen: body["last_update"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            indicators: vulns,
            tags,
            raw: body.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IntelSource for ShodanClient {
    fn name(&self) -> ThreatSource {
        ThreatSource::Shodan
    }

    fn reliability(&self) -> f64 {
        self.reliability
    }

    async fn ip_reputation(&self, ip: &str) -> DshieldResult<SourceResult> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| DshieldError::external("shodan", "api key not configured"))?;

        let response = self
            .http
            .get(format!("{}/shodan/host/{}", self.base_url, ip))
            .query(&[("key", key.expose_secret())])
            .send()
            .await
            .map_err(|e| DshieldError::external("shodan", e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| DshieldError::external("shodan", e.to_string()))?;
                Ok(Self::parse_host(&body))
            }
            // Shodan has never seen the host
            reqwest::StatusCode::NOT_FOUND => Ok(SourceResult {
                confidence: Some(DEFAULT_CONFIDENCE),
                ..Default::default()
            }),
            status => Err(DshieldError::external("shodan", format!("status {}", status))),
        }
    }
}

impl std::fmt::Debug for ShodanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShodanClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_host_with_vulns() {
        let body = json!({
            "country_name": "United States",
            "city": "Clifton",
            "asn": "AS14061",
            "org": "DigitalOcean",
            "isp": "DigitalOcean, LLC",
            "last_update": "2025-01-10T08:00:00+00:00",
            "vulns": ["CVE-2024-6387", "CVE-2023-38408"],
            "tags": ["cloud"]
        });

        let result = ShodanClient::parse_host(&body);
        assert_eq!(result.threat_score, Some(30.0));
        assert_eq!(result.indicators, vec!["CVE-2024-6387", "CVE-2023-38408"]);
        assert_eq!(result.isp.as_deref(), Some("DigitalOcean, LLC"));
        assert_eq!(result.city.as_deref(), Some("Clifton"));
        assert!(result.last_seen.is_some());
    }

    #[test]
    fn test_parse_host_without_vulns_scores_nothing() {
        let body = json!({ "country_name": "Germany", "ports": [80, 443] });
        let result = ShodanClient::parse_host(&body);
        assert_eq!(result.threat_score, None);
    }

    #[test]
    fn test_vuln_score_is_capped() {
        let vulns: Vec<String> = (0..20).map(|i| format!("CVE-2024-{:04}", i)).collect();
        let body = json!({ "vulns": vulns });
        let result = ShodanClient::parse_host(&body);
        assert_eq!(result.threat_score, Some(100.0));
    }
}

//! AbuseIPDB client

use super::{http_client, IntelSource};
use async_trait::async_trait;
use dshield_core::{DshieldError, DshieldResult, SourceConfig, SourceResult, ThreatSource};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://api.abuseipdb.com/api/v2";
const DEFAULT_CONFIDENCE: f64 = 0.8;
const MAX_AGE_DAYS: u32 = 90;

/// Client for the AbuseIPDB check endpoint.
pub struct AbuseIpdbClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    reliability: f64,
}

impl AbuseIpdbClient {
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

    fn parse_check(body: &Value) -> SourceResult {
        let data = &body["data"];

        // abuseConfidenceScore is already a 0-100 threat measure
        let threat_score = data["abuseConfidenceScore"]
            .as_f64()
            .filter(|score| (0.0..=100.0).contains(score));

        let categories: Vec<String> = data["reports"]
            .as_array()
            .map(|reports| {
                let mut seen = std::collections::BTreeSet::new();
                for report in reports {
                    if let Some(cats) = report["categories"].as_array() {
                        for cat in cats {
                            if let Some(n) = cat.as_u64() {
                                seen.insert(format!("abuse-category-{}", n));
                            }
                        }
                    }
                }
                seen.into_iter().collect()
            })
            .unwrap_or_default();

        SourceResult {
            threat_score,
            confidence: Some(DEFAULT_CONFIDENCE),
            country: data["countryCode"].as_str().map(str::to_string),
            isp: data["isp"].as_str().map(str::to_string),
            organization: data["domain"].as_str().map(str::to_string),
            last_seen: data["lastReportedAt"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            tags: categories,
            raw: body.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IntelSource for AbuseIpdbClient {
    fn name(&self) -> ThreatSource {
        ThreatSource::Abuseipdb
    }

    fn reliability(&self) -> f64 {
        self.reliability
    }

    async fn ip_reputation(&self, ip: &str) -> DshieldResult<SourceResult> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| DshieldError::external("abuseipdb", "api key not configured"))?;

        let response = self
            .http
            .get(format!("{}/check", self.base_url))
            .header("Key", key.expose_secret())
            .header("Accept", "application/json")
            .query(&[
                ("ipAddress", ip),
                ("maxAgeInDays", &MAX_AGE_DAYS.to_string()),
                ("verbose", "true"),
            ])
            .send()
            .await
            .map_err(|e| DshieldError::external("abuseipdb", e.to_string()))?;

        if !response.status().is_success() {
            return Err(DshieldError::external(
                "abuseipdb",
                format!("status {}", response.status()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DshieldError::external("abuseipdb", e.to_string()))?;
        Ok(Self::parse_check(&body))
    }
}

impl std::fmt::Debug for AbuseIpdbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbuseIpdbClient")
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
    fn test_parse_check() {
        let body = json!({
            "data": {
                "ipAddress": "192.0.2.77",
                "abuseConfidenceScore": 100,
                "countryCode": "RU",
                "isp": "Example Telecom",
                "domain": "example.ru",
                "lastReportedAt": "2025-01-20T14:30:00+00:00",
                "reports": [
                    { "categories": [18, 22] },
                    { "categories": [22] }
                ]
            }
        });

        let result = AbuseIpdbClient::parse_check(&body);
        assert_eq!(result.threat_score, Some(100.0));
        assert_eq!(result.country.as_deref(), Some("RU"));
        assert_eq!(
            result.tags,
            vec!["abuse-category-18", "abuse-category-22"]
        );
        assert!(result.last_seen.is_some());
    }

    #[test]
    fn test_parse_unreported_ip() {
        let body = json!({ "data": { "ipAddress": "203.0.113.5", "abuseConfidenceScore": 0 } });
        let result = AbuseIpdbClient::parse_check(&body);
        assert_eq!(result.threat_score, Some(0.0));
        assert!(result.tags.is_empty());
    }
}

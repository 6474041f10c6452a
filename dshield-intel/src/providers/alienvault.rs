//! AlienVault OTX client

use super::{http_client, IntelSource};
use async_trait::async_trait;
use dshield_core::{DshieldError, DshieldResult, SourceConfig, SourceResult, ThreatSource};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://otx.alienvault.com/api/v1";
const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Points per referencing pulse when deriving a threat score.
const SCORE_PER_PULSE: f64 = 10.0;

/// Client for the AlienVault OTX indicators API.
pub struct AlienVaultClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    reliability: f64,
}

impl AlienVaultClient {
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

    async fn fetch_general(&self, kind: &str, indicator: &str) -> DshieldResult<Value> {
        let mut request = self.http.get(format!(
            "{}/indicators/{}/{}/general",
            self.base_url, kind, indicator
        ));
        if let Some(key) = &self.api_key {
            request = request.header("X-OTX-API-KEY", key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DshieldError::external("alienvault", e.to_string()))?;
        if !response.status().is_success() {
            return Err(DshieldError::external(
                "alienvault",
                format!("status {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| DshieldError::external("alienvault", e.to_string()))
    }

    fn parse_general(body: &Value) -> SourceResult {
        let pulse_info = &body["pulse_info"];
        let pulse_count = pulse_info["count"].as_u64().unwrap_or(0);

        // No pulses means OTX has no verdict, not a clean bill
        let threat_score =
            (pulse_count > 0).then(|| (pulse_count as f64 * SCORE_PER_PULSE).min(100.0));

        let mut tags: Vec<String> = Vec::new();
        if let Some(pulses) = pulse_info["pulses"].as_array() {
            for pulse in pulses {
                if let Some(pulse_tags) = pulse["tags"].as_array() {
                    for tag in pulse_tags.iter().filter_map(Value::as_str) {
                        if !tags.iter().any(|t| t == tag) {
                            tags.push(tag.to_string());
                        }
                    }
                }
            }
        }

        let indicators: Vec<String> = pulse_info["pulses"]
            .as_array()
            .map(|pulses| {
                pulses
                    .iter()
                    .filter_map(|p| p["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        SourceResult {
            threat_score,
            confidence: Some(DEFAULT_CONFIDENCE),
            country: body["country_name"].as_str().map(str::to_string),
            city: body["city"].as_str().map(str::to_string),
            asn: body["asn"].as_str().map(str::to_string),
            tags,
            indicators,
            raw: body.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IntelSource for AlienVaultClient {
    fn name(&self) -> ThreatSource {
        ThreatSource::Alienvault
    }

    fn reliability(&self) -> f64 {
        self.reliability
    }

    fn supports_domains(&self) -> bool {
        true
    }

    async fn ip_reputation(&self, ip: &str) -> DshieldResult<SourceResult> {
        let kind = if ip.contains(':') { "IPv6" } else { "IPv4" };
        let body = self.fetch_general(kind, ip).await?;
        Ok(Self::parse_general(&body))
    }

    async fn domain_report(&self, domain: &str) -> DshieldResult<SourceResult> {
        let body = self.fetch_general("domain", domain).await?;
        Ok(Self::parse_general(&body))
    }
}

impl std::fmt::Debug for AlienVaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlienVaultClient")
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
    fn test_parse_with_pulses() {
        let body = json!({
            "country_name": "Romania",
            "asn": "AS9009",
            "pulse_info": {
                "count": 3,
                "pulses": [
                    { "name": "SSH brute forcers", "tags": ["ssh", "bruteforce"] },
                    { "name": "Botnet C2", "tags": ["botnet", "ssh"] },
                    { "name": "Mass scanners", "tags": [] }
                ]
            }
        });

        let result = AlienVaultClient::parse_general(&body);
        assert_eq!(result.threat_score, Some(30.0));
        assert_eq!(result.tags, vec!["ssh", "bruteforce", "botnet"]);
        assert_eq!(result.indicators.len(), 3);
        assert_eq!(result.country.as_deref(), Some("Romania"));
    }

    #[test]
    fn test_parse_without_pulses_has_no_score() {
        let body = json!({ "pulse_info": { "count": 0, "pulses": [] } });
        let result = AlienVaultClient::parse_general(&body);
        assert_eq!(result.threat_score, None);
    }

    #[test]
    fn test_pulse_score_capped_at_100() {
        let body = json!({ "pulse_info": { "count": 40 } });
        let result = AlienVaultClient::parse_general(&body);
        assert_eq!(result.threat_score, Some(100.0));
    }
}

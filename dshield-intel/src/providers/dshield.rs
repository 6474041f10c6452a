//! DShield threat intelligence client
//!
//! Queries the DShield API for IP reputation. An IP unknown to DShield is
//! a neutral default result, not an error.

use super::{http_client, IntelSource};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dshield_core::{DshieldError, DshieldResult, SourceConfig, SourceResult, ThreatSource};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://dshield.org/api";
const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Client for the DShield API.
pub struct DshieldClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    reliability: f64,
}

impl DshieldClient {
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

    /// Parse the `{"ip": {...}}` envelope into a normalized result.
    fn parse_ip_response(body: &Value) -> SourceResult {
        let data = body.get("ip").unwrap_or(body);

        let reputation_score = data
            .get("reputation")
            .and_then(value_as_f64)
            .filter(|score| (0.0..=100.0).contains(score));

        let attack_types = match data.get("attacks") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            // DShield sometimes reports a bare attack count instead
            Some(Value::Number(_)) => Vec::new(),
            _ => Vec::new(),
        };

        SourceResult {
            reputation_score,
            confidence: Some(DEFAULT_CONFIDENCE),
            country: string_at(data, "ascountry").or_else(|| string_at(data, "country")),
            asn: data
                .get("as")
                .or_else(|| data.get("asn"))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            organization: string_at(data, "asname").or_else(|| string_at(data, "org")),
            first_seen: date_at(data, "mindate").or_else(|| date_at(data, "firstseen")),
            last_seen: date_at(data, "maxdate").or_else(|| date_at(data, "lastseen")),
            attack_types,
            tags: match data.get("tags") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            },
            raw: body.clone(),
            ..Default::default()
        }
    }
}

fn string_at(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// DShield dates come as `YYYY-MM-DD` or RFC 3339.
fn date_at(data: &Value, key: &str) -> Option<DateTime<Utc>> {
    let text = data.get(key)?.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl IntelSource for DshieldClient {
    fn name(&self) -> ThreatSource {
        ThreatSource::Dshield
    }

    fn reliability(&self) -> f64 {
        self.reliability
    }

    async fn ip_reputation(&self, ip: &str) -> DshieldResult<SourceResult> {
        let url = format!("{}/ip/{}?json", self.base_url, ip);
        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DshieldError::external("dshield", e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| DshieldError::external("dshield", e.to_string()))?;
                Ok(Self::parse_ip_response(&body))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(SourceResult {
                confidence: Some(DEFAULT_CONFIDENCE),
                ..Default::default()
            }),
            status => Err(DshieldError::external(
                "dshield",
                format!("status {}", status),
            )),
        }
    }
}

impl std::fmt::Debug for DshieldClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DshieldClient")
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
    fn test_parse_full_response() {
        let body = json!({
            "ip": {
                "number": "192.0.2.1",
                "reputation": 75,
                "ascountry": "CN",
                "as": 4134,
                "asname": "CHINANET-BACKBONE",
                "mindate": "2024-11-02",
                "maxdate": "2025-01-15",
                "attacks": ["ssh", "telnet"],
                "tags": ["scanner"]
            }
        });

        let result = DshieldClient::parse_ip_response(&body);
        assert_eq!(result.reputation_score, Some(75.0));
        assert_eq!(result.threat_score, None, "dshield reports reputation only");
        assert_eq!(result.country.as_deref(), Some("CN"));
        assert_eq!(result.asn.as_deref(), Some("4134"));
        assert_eq!(result.organization.as_deref(), Some("CHINANET-BACKBONE"));
        assert_eq!(result.attack_types, vec!["ssh", "telnet"]);
        assert_eq!(result.tags, vec!["scanner"]);
        assert_eq!(
            result.first_seen.expect("first seen").date_naive().to_string(),
            "2024-11-02"
        );
    }

    #[test]
    fn test_parse_sparse_response_has_no_signal() {
        let body = json!({ "ip": { "number": "198.51.100.9" } });
        let result = DshieldClient::parse_ip_response(&body);
        assert_eq!(result.reputation_score, None);
        assert_eq!(result.threat_score, None);
        assert!(result.attack_types.is_empty());
    }

    #[test]
    fn test_out_of_range_reputation_dropped() {
        let body = json!({ "ip": { "reputation": 400 } });
        let result = DshieldClient::parse_ip_response(&body);
        assert_eq!(result.reputation_score, None);
    }
}

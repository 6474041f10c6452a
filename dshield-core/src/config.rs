//! Typed configuration for the DShield MCP server
//!
//! Loads the YAML configuration file, resolves `op://` secret references
//! through the external secret CLI, and validates ranges. Configuration is
//! immutable after load; a validation failure here is fatal at startup.

use crate::{ConfigError, FallbackStrategy, OptimizationLevel, ThreatSource};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "DSHIELD_MCP_CONFIG";

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "mcp_config.yaml";

// ============================================================================
// SECTIONS
// ============================================================================

/// Elasticsearch connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchConfig {
    /// Cluster URL, e.g. `https://siem.example.org:9200`.
    pub url: String,
    /// Basic auth username.
    pub username: Option<String>,
    /// Basic auth password; may be an `op://` reference in the file.
    pub password: Option<SecretString>,
    /// Whether to verify TLS certificates.
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_es_timeout")]
    pub timeout_seconds: u64,
    /// Index patterns to query, in preference order.
    #[serde(default = "default_index_patterns")]
    pub index_patterns: Vec<String>,
    /// Patterns to fall back to when discovery finds nothing.
    #[serde(default = "default_fallback_indices")]
    pub fallback_indices: Vec<String>,
    /// Forward the server's compatibility mode header.
    #[serde(default)]
    pub compatibility_mode: bool,
}

/// Settings for one threat intelligence source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Whether this source participates in enrichment.
    #[serde(default)]
    pub enabled: bool,
    /// API key; may be an `op://` reference in the file.
    pub api_key: Option<SecretString>,
    /// Override for the provider base URL.
    pub base_url: Option<String>,
    /// Sliding-window request budget per minute.
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_requests_per_minute: u32,
    /// Maximum concurrent in-flight requests.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Per-request timeout in seconds.
    #[serde(default = "default_source_timeout")]
    pub timeout_seconds: u64,
    /// Bounded retries while waiting out the rate window.
    #[serde(default = "default_backoff_attempts")]
    pub max_backoff_attempts: u32,
    /// Reliability weight in [0, 1]; defaults per source.
    pub reliability: Option<f64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            base_url: None,
            rate_limit_requests_per_minute: default_rate_limit_rpm(),
            concurrency_limit: default_concurrency_limit(),
            timeout_seconds: default_source_timeout(),
            max_backoff_attempts: default_backoff_attempts(),
            reliability: None,
        }
    }
}

/// Correlation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    /// Indicators below this weighted confidence are dropped.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// Enrichment writeback settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WritebackConfig {
    /// Whether correlated verdicts are indexed back into the SIEM.
    #[serde(default)]
    pub writeback_enabled: bool,
    /// Index name prefix; documents land in `<prefix>-YYYY.MM`.
    #[serde(default = "default_writeback_prefix")]
    pub index_prefix: String,
    /// Use `<indicator>_<day>` ids so repeated enrichments overwrite.
    #[serde(default)]
    pub dedup_by_day: bool,
}

/// Threat intelligence section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ThreatIntelConfig {
    /// Per-source settings keyed by source label.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    /// Correlation parameters.
    #[serde(default)]
    pub correlation: CorrelationConfig,
    /// Writeback settings.
    #[serde(default)]
    pub elasticsearch: WritebackConfig,
    /// Memory-tier TTL in hours.
    #[serde(default = "default_memory_ttl_hours")]
    pub cache_ttl_hours: u64,
    /// Memory-tier entry bound.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
}

impl ThreatIntelConfig {
    /// Settings for a source, falling back to defaults when absent.
    pub fn source(&self, source: ThreatSource) -> SourceConfig {
        self.sources.get(source.label()).cloned().unwrap_or_default()
    }

    /// Reliability weight for a source.
    pub fn reliability(&self, source: ThreatSource) -> f64 {
        self.source(source)
            .reliability
            .unwrap_or_else(|| source.default_reliability())
    }

    /// Sources enabled in configuration, in configuration order.
    pub fn enabled_sources(&self) -> Vec<ThreatSource> {
        ThreatSource::ALL
            .into_iter()
            .filter(|s| self.source(*s).enabled)
            .collect()
    }
}

/// One API key accepted on the TCP transport.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    /// The key value; may be an `op://` reference in the file.
    pub key: SecretString,
    /// Permissions granted to this key.
    #[serde(default = "default_permissions")]
    pub permissions: Vec<String>,
    /// Optional expiry; expired keys fail authentication.
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// TCP transport section.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpTransportConfig {
    /// Bind address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listen port.
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Maximum concurrent connections accepted.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout before the janitor closes a connection, in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    /// Per-connection token bucket refill rate, requests per minute.
    #[serde(default = "default_conn_rpm")]
    pub rate_limit_requests_per_minute: u32,
    /// Per-connection burst size (initial tokens).
    #[serde(default = "default_conn_burst")]
    pub rate_limit_burst: u32,
    /// Maximum frame payload size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size_bytes: usize,
    /// Accepted API keys.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_tcp_port(),
            max_connections: default_max_connections(),
            connection_timeout_seconds: default_connection_timeout(),
            rate_limit_requests_per_minute: default_conn_rpm(),
            rate_limit_burst: default_conn_burst(),
            max_message_size_bytes: default_max_message_size(),
            api_keys: Vec::new(),
        }
    }
}

/// Retry policy for idempotent reads against external services.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
        }
    }
}

/// Timeout budget section.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSettings {
    /// Default deadline for a tool call, in seconds.
    #[serde(default = "default_tool_timeout")]
    pub tool_call_seconds: u64,
    /// Per-tool overrides keyed by tool name.
    #[serde(default)]
    pub per_tool_seconds: BTreeMap<String, u64>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            tool_call_seconds: default_tool_timeout(),
            per_tool_seconds: BTreeMap::new(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter, e.g. `info` or `dshield_siem=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Include backtraces in internal-error log records.
    #[serde(default)]
    pub include_stack_trace: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            include_stack_trace: false,
        }
    }
}

/// Error-handling section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ErrorHandlingConfig {
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub retry_settings: RetrySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Query pipeline section.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Default page size when the caller does not specify one.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    /// Largest page size a caller may request.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
    /// Per-query backend timeout in seconds.
    #[serde(default = "default_query_timeout")]
    pub timeout_seconds: u64,
    /// Result byte budget in megabytes.
    #[serde(default = "default_max_result_size_mb")]
    pub max_result_size_mb: f64,
    /// Fallback when optimization cannot fit the budget.
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
    /// Whether the optimization cascade runs at all.
    #[serde(default)]
    pub optimization: OptimizationLevel,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            timeout_seconds: default_query_timeout(),
            max_result_size_mb: default_max_result_size_mb(),
            fallback_strategy: FallbackStrategy::default(),
            optimization: OptimizationLevel::default(),
        }
    }
}

/// Performance and cache section.
#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    /// Whether the in-memory cache tier is used.
    #[serde(default = "default_true")]
    pub enable_memory_cache: bool,
    /// Whether the persistent cache tier is used.
    #[serde(default = "default_true")]
    pub enable_persistent_cache: bool,
    /// Data directory holding the persistent cache database.
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// Persistent-tier TTL in hours.
    #[serde(default = "default_persistent_ttl_hours")]
    pub persistent_cache_ttl_hours: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_memory_cache: true,
            enable_persistent_cache: true,
            data_directory: default_data_directory(),
            persistent_cache_ttl_hours: default_persistent_ttl_hours(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub threat_intelligence: ThreatIntelConfig,
    #[serde(default)]
    pub tcp_transport: TcpTransportConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

impl AppConfig {
    /// Validate ranges across all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.query;
        if q.max_page_size == 0 || q.max_page_size > crate::MAX_QUERY_SIZE {
            return Err(invalid(
                "query.max_page_size",
                q.max_page_size,
                "must be in [1, 10000]",
            ));
        }
        if q.default_page_size == 0 || q.default_page_size > q.max_page_size {
            return Err(invalid(
                "query.default_page_size",
                q.default_page_size,
                "must be in [1, max_page_size]",
            ));
        }
        if q.max_result_size_mb <= 0.0 {
            return Err(invalid(
                "query.max_result_size_mb",
                q.max_result_size_mb,
                "must be positive",
            ));
        }

        let r = &self.error_handling.retry_settings;
        if r.exponential_base <= 1.0 {
            return Err(invalid(
                "error_handling.retry_settings.exponential_base",
                r.exponential_base,
                "must be greater than 1",
            ));
        }
        if r.base_delay_ms == 0 || r.base_delay_ms > r.max_delay_ms {
            return Err(invalid(
                "error_handling.retry_settings.base_delay_ms",
                r.base_delay_ms,
                "must be in [1, max_delay_ms]",
            ));
        }
        if self.error_handling.timeouts.tool_call_seconds == 0 {
            return Err(invalid(
                "error_handling.timeouts.tool_call_seconds",
                0,
                "must be positive",
            ));
        }

        let c = &self.threat_intelligence.correlation;
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return Err(invalid(
                "threat_intelligence.correlation.confidence_threshold",
                c.confidence_threshold,
                "must be in [0, 1]",
            ));
        }
        for (label, source) in &self.threat_intelligence.sources {
            if let Some(reliability) = source.reliability {
                if !(0.0..=1.0).contains(&reliability) {
                    return Err(invalid(
                        &format!("threat_intelligence.sources.{}.reliability", label),
                        reliability,
                        "must be in [0, 1]",
                    ));
                }
            }
            if source.rate_limit_requests_per_minute == 0 {
                return Err(invalid(
                    &format!(
                        "threat_intelligence.sources.{}.rate_limit_requests_per_minute",
                        label
                    ),
                    0,
                    "must be positive",
                ));
            }
            if source.concurrency_limit == 0 {
                return Err(invalid(
                    &format!("threat_intelligence.sources.{}.concurrency_limit", label),
                    0,
                    "must be positive",
                ));
            }
        }

        if self.tcp_transport.rate_limit_burst == 0 {
            return Err(invalid(
                "tcp_transport.rate_limit_burst",
                0,
                "must be positive",
            ));
        }
        if self.tcp_transport.max_message_size_bytes == 0 {
            return Err(invalid(
                "tcp_transport.max_message_size_bytes",
                0,
                "must be positive",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// SECRET RESOLUTION
// ============================================================================

/// Resolver for `op://vault/item/field` secret references.
pub trait SecretResolver {
    /// Resolve one reference to its plaintext value.
    ///
    /// `Ok(None)` means the secret tool is unavailable and the URI should be
    /// left in place; `Err` means the tool ran and failed, which is fatal
    /// for a referenced secret.
    fn resolve(&self, reference: &str) -> Result<Option<String>, ConfigError>;
}

/// Resolver backed by the 1Password CLI (`op read`).
#[derive(Debug, Default)]
pub struct OpCliResolver;

impl SecretResolver for OpCliResolver {
    fn resolve(&self, reference: &str) -> Result<Option<String>, ConfigError> {
        let output = match std::process::Command::new("op")
            .args(["read", reference])
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(reference, "secret CLI unavailable; leaving reference in place");
                return Ok(None);
            }
            Err(e) => {
                return Err(ConfigError::SecretResolution {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Err(ConfigError::SecretResolution {
                reference: reference.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Recursively resolve `op://` references in string values.
fn resolve_secrets(
    value: serde_yaml::Value,
    resolver: &dyn SecretResolver,
) -> Result<serde_yaml::Value, ConfigError> {
    use serde_yaml::Value;
    Ok(match value {
        Value::String(s) if s.starts_with("op://") => match resolver.resolve(&s)? {
            Some(resolved) => Value::String(resolved),
            None => Value::String(s),
        },
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| Ok((k, resolve_secrets(v, resolver)?)))
                .collect::<Result<_, ConfigError>>()?,
        ),
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter()
                .map(|v| resolve_secrets(v, resolver))
                .collect::<Result<_, ConfigError>>()?,
        ),
        other => other,
    })
}

// ============================================================================
// LOADER
// ============================================================================

/// Resolve the configuration path: explicit argument, then the
/// `DSHIELD_MCP_CONFIG` environment variable, then the default file name.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Load, resolve secrets in, and validate the configuration file.
pub fn load_config(path: &Path, resolver: &dyn SecretResolver) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })?;

    let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })?;
    if !value.is_mapping() {
        return Err(ConfigError::Parse {
            reason: "config file is not a YAML mapping".to_string(),
        });
    }

    let resolved = resolve_secrets(value, resolver)?;
    let config: AppConfig =
        serde_yaml::from_value(resolved).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

// ============================================================================
// DEFAULTS
// ============================================================================

fn default_true() -> bool {
    true
}
fn default_es_timeout() -> u64 {
    30
}
fn default_index_patterns() -> Vec<String> {
    vec![
        "dshield-*".to_string(),
        "cowrie-*".to_string(),
        "zeek-*".to_string(),
    ]
}
fn default_fallback_indices() -> Vec<String> {
    vec!["dshield-*".to_string()]
}
fn default_rate_limit_rpm() -> u32 {
    60
}
fn default_concurrency_limit() -> usize {
    5
}
fn default_source_timeout() -> u64 {
    30
}
fn default_backoff_attempts() -> u32 {
    3
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_writeback_prefix() -> String {
    "enrichment-intel".to_string()
}
fn default_memory_ttl_hours() -> u64 {
    1
}
fn default_max_cache_size() -> usize {
    1000
}
fn default_permissions() -> Vec<String> {
    vec!["read".to_string()]
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_tcp_port() -> u16 {
    3000
}
fn default_max_connections() -> usize {
    10
}
fn default_connection_timeout() -> u64 {
    300
}
fn default_conn_rpm() -> u32 {
    60
}
fn default_conn_burst() -> u32 {
    10
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_exponential_base() -> f64 {
    2.0
}
fn default_tool_timeout() -> u64 {
    120
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_max_page_size() -> u32 {
    1000
}
fn default_query_timeout() -> u64 {
    30
}
fn default_max_result_size_mb() -> f64 {
    10.0
}
fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}
fn default_persistent_ttl_hours() -> u64 {
    24
}

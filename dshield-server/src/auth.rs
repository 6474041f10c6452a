//! API-key authentication for the network transport
//!
//! Keys come from the `tcp_transport.api_keys` config section; each carries
//! a permission set and an optional expiry. Only transport peers are
//! authenticated here, never end users.

use chrono::{DateTime, Utc};
use dshield_core::{ApiKeyConfig, TransportError};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::str::FromStr;

/// What an authenticated connection may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// SIEM queries, statistics, streaming.
    Read,
    /// Threat intelligence enrichment.
    Enrich,
    /// Health checks and diagnostics.
    Diagnostics,
}

impl Permission {
    /// The full permission set, granted to local sessions.
    pub fn all() -> HashSet<Permission> {
        HashSet::from([Permission::Read, Permission::Enrich, Permission::Diagnostics])
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "enrich" => Ok(Permission::Enrich),
            "diagnostics" => Ok(Permission::Diagnostics),
            other => Err(format!("unknown permission: {}", other)),
        }
    }
}

struct KeyEntry {
    key: SecretString,
    permissions: HashSet<Permission>,
    expires_at: Option<DateTime<Utc>>,
}

/// Validates presented API keys against the configured key set.
pub struct Authenticator {
    keys: Vec<KeyEntry>,
}

impl Authenticator {
    pub fn from_config(configs: &[ApiKeyConfig]) -> Self {
        let keys = configs
            .iter()
            .map(|config| {
                let permissions = config
                    .permissions
                    .iter()
                    .filter_map(|name| match name.parse() {
                        Ok(permission) => Some(permission),
                        Err(reason) => {
                            tracing::warn!(%reason, "ignoring unknown permission in api key");
                            None
                        }
                    })
                    .collect();
                KeyEntry {
                    key: config.key.clone(),
                    permissions,
                    expires_at: config.expires_at,
                }
            })
            .collect();
        Self { keys }
    }

    /// Whether authentication is required at all.
    ///
    /// With no keys configured the network transport runs open; this is
    /// logged loudly at startup.
    pub fn required(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Validate a presented key, returning its permission set.
    pub fn authenticate(&self, presented: &str) -> Result<HashSet<Permission>, TransportError> {
        for entry in &self.keys {
            if constant_time_eq(entry.key.expose_secret().as_bytes(), presented.as_bytes()) {
                if let Some(expires_at) = entry.expires_at {
                    if expires_at <= Utc::now() {
                        return Err(TransportError::AuthenticationFailed {
                            reason: "api key expired".to_string(),
                        });
                    }
                }
                return Ok(entry.permissions.clone());
            }
        }
        Err(TransportError::AuthenticationFailed {
            reason: "unknown api key".to_string(),
        })
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("keys", &format!("[{} REDACTED]", self.keys.len()))
            .finish()
    }
}

/// Length-safe comparison that does not short-circuit on content.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

//! Dependency health checks
//!
//! Five checks run concurrently, each under its own timeout: the SIEM
//! cluster, the threat intelligence API layer, the LaTeX toolchain (used
//! by the external report pipeline), the per-source intel status, and the
//! cache database.

use crate::state::ServerState;
use chrono::Utc;
use dshield_core::{HealthCheck, HealthReport, HealthStatus};
use serde_json::json;
use std::time::{Duration, Instant};

const SIEM_TIMEOUT: Duration = Duration::from_secs(30);
const INTEL_API_TIMEOUT: Duration = Duration::from_secs(30);
const LATEX_TIMEOUT: Duration = Duration::from_secs(10);
const INTEL_SOURCES_TIMEOUT: Duration = Duration::from_secs(15);
const DATABASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run all checks concurrently and aggregate the outcome.
pub async fn run_all_checks(state: &ServerState) -> HealthReport {
    let (siem, intel_api, latex, intel_sources, database) = tokio::join!(
        with_timeout("elasticsearch", SIEM_TIMEOUT, check_siem(state)),
        with_timeout("threat_intel_api", INTEL_API_TIMEOUT, check_intel_api(state)),
        with_timeout("latex", LATEX_TIMEOUT, check_latex()),
        with_timeout(
            "threat_intel_sources",
            INTEL_SOURCES_TIMEOUT,
            check_intel_sources(state)
        ),
        with_timeout("cache_database", DATABASE_TIMEOUT, check_database(state)),
    );

    let checks = vec![siem, intel_api, latex, intel_sources, database];
    let healthy_services: Vec<String> = checks
        .iter()
        .filter(|c| c.status == HealthStatus::Healthy)
        .map(|c| c.component.clone())
        .collect();
    let unhealthy_services: Vec<String> = checks
        .iter()
        .filter(|c| c.status != HealthStatus::Healthy)
        .map(|c| c.component.clone())
        .collect();

    HealthReport {
        overall_health: healthy_services.len() as f64 / checks.len() as f64,
        healthy_services,
        unhealthy_services,
        last_check_timestamp: Utc::now(),
        checks,
    }
}

async fn with_timeout(
    component: &str,
    timeout: Duration,
    check: impl std::future::Future<Output = HealthCheck>,
) -> HealthCheck {
    let started = Instant::now();
    let mut result = match tokio::time::timeout(timeout, check).await {
        Ok(check) => check,
        Err(_) => HealthCheck::unhealthy(component, format!("check timed out after {:?}", timeout)),
    };
    result.response_time_ms = Some(started.elapsed().as_millis() as i64);
    result
}

async fn check_siem(state: &ServerState) -> HealthCheck {
    match state.siem.backend().cluster_health().await {
        Ok(health) => {
            let status = health["status"].as_str().unwrap_or("unknown");
            let check = match status {
                "green" | "yellow" => HealthCheck::healthy("elasticsearch"),
                "red" => HealthCheck::degraded("elasticsearch", "cluster status red"),
                other => {
                    HealthCheck::degraded("elasticsearch", format!("cluster status {}", other))
                }
            };
            check.with_metadata("cluster_status", json!(status))
        }
        Err(err) => HealthCheck::unhealthy("elasticsearch", err.to_string()),
    }
}

async fn check_intel_api(state: &ServerState) -> HealthCheck {
    let status = state.intel.source_status();
    if status.is_empty() {
        HealthCheck::unhealthy("threat_intel_api", "no sources enabled")
    } else {
        HealthCheck::healthy("threat_intel_api")
            .with_metadata("source_count", json!(status.len()))
    }
}

async fn check_latex() -> HealthCheck {
    match tokio::process::Command::new("pdflatex")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
    {
        Ok(exit) if exit.success() => HealthCheck::healthy("latex"),
        Ok(exit) => HealthCheck::degraded("latex", format!("pdflatex exited with {}", exit)),
        Err(_) => HealthCheck::unhealthy("latex", "pdflatex not found"),
    }
}

async fn check_intel_sources(state: &ServerState) -> HealthCheck {
    let status = state.intel.source_status();
    if status.is_empty() {
        return HealthCheck::unhealthy("threat_intel_sources", "no sources enabled");
    }

    // A source with no free permits is saturated, not down
    let saturated: Vec<String> = status
        .iter()
        .filter(|s| s.available_permits == 0)
        .map(|s| s.source.label().to_string())
        .collect();

    let check = if saturated.is_empty() {
        HealthCheck::healthy("threat_intel_sources")
    } else {
        HealthCheck::degraded(
            "threat_intel_sources",
            format!("saturated sources: {}", saturated.join(", ")),
        )
    };
    check.with_metadata(
        "sources",
        serde_json::to_value(&status).unwrap_or(serde_json::Value::Null),
    )
}

async fn check_database(state: &ServerState) -> HealthCheck {
    match state.intel.cache_statistics() {
        Ok(stats) => HealthCheck::healthy("cache_database")
            .with_metadata("valid_entries", json!(stats.persistent_valid_entries))
            .with_metadata("disk_bytes", json!(stats.disk_bytes)),
        Err(err) => HealthCheck::unhealthy("cache_database", err.to_string()),
    }
}

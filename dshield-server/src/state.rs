//! Shared server state
//!
//! One owned service object holding the engine, orchestrator, and
//! configuration, passed down to transports and tool handlers. The only
//! process-wide state outside this object is the logger.

use dshield_core::AppConfig;
use dshield_intel::ThreatIntelManager;
use dshield_siem::SiemEngine;
use std::time::Instant;

/// Application-wide state shared across transports and tool handlers.
pub struct ServerState {
    pub config: AppConfig,
    pub siem: SiemEngine,
    pub intel: ThreatIntelManager,
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(config: AppConfig, siem: SiemEngine, intel: ThreatIntelManager) -> Self {
        Self {
            config,
            siem,
            intel,
            start_time: Instant::now(),
        }
    }

    /// Seconds since the server started.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("uptime_seconds", &self.uptime_seconds())
            .finish()
    }
}

// src/supervisor/health.rs
//! Worker health record and policy
//!
//! A worker is unhealthy when any of these hold:
//! - `max_consecutive_failures` pings in a row failed or timed out
//! - `restart_count` exceeds `max_restarts`
//! - the last successful check is older than `stale_after`
//!
//! Unhealthy gates new work only; it never kills the worker.

use crate::utils::config::SupervisorSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub connected: bool,

    /// Automatic restarts since the last `initialize` or `clear_failure`
    pub restart_count: u32,

    pub last_health_check_at: Option<DateTime<Utc>>,

    pub is_restarting: bool,

    pub consecutive_failures: u32,

    #[serde(skip)]
    last_check: Option<Instant>,
}

impl WorkerHealth {
    /// A fresh connection counts as a successful check
    pub fn mark_connected(&mut self, now: Instant) {
        self.connected = true;
        self.is_restarting = false;
        self.record_success(now);
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.last_check = Some(now);
        self.last_health_check_at = Some(Utc::now());
    }

    /// Returns the new consecutive failure count
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    /// `Err` carries the reason the worker may not take new work
    pub fn assess(&self, policy: &SupervisorSettings, now: Instant) -> Result<(), String> {
        if !self.connected {
            return Err("worker is not connected".to_string());
        }
        if self.is_restarting {
            return Err("worker is restarting".to_string());
        }
        if self.consecutive_failures >= policy.max_consecutive_failures {
            return Err(format!(
                "{} consecutive health checks failed",
                self.consecutive_failures
            ));
        }
        if self.restart_count > policy.max_restarts {
            return Err(format!(
                "restart count {} exceeds limit {}",
                self.restart_count, policy.max_restarts
            ));
        }
        match self.last_check {
            Some(at) if now.saturating_duration_since(at) <= policy.stale_after() => Ok(()),
            Some(at) => Err(format!(
                "last successful health check was {}s ago",
                now.saturating_duration_since(at).as_secs()
            )),
            None => Err("worker has never passed a health check".to_string()),
        }
    }

    pub fn is_healthy(&self, policy: &SupervisorSettings, now: Instant) -> bool {
        self.assess(policy, now).is_ok()
    }
}

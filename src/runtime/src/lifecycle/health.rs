//! Health probes.
//!
//! A probe execs the configured test inside the container. Results are kept
//! in `health.json` in the state directory so `inspect` and later probes see
//! the failing streak.

use std::path::Path;
use std::time::Duration;

use cdbox_core::container::HealthCheck;
use cdbox_core::error::{BoxError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exec::ExecOptions;
use super::{Container, ContainerManager};
use crate::fs::{read_json, write_json};

pub const HEALTH_FILE: &str = "health.json";

/// Probe results kept in the log.
const MAX_LOG_ENTRIES: usize = 5;

/// Exit code recorded for a probe that timed out.
const TIMEOUT_EXIT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthLogEntry {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthState {
    pub status: HealthStatus,
    pub failing_streak: u32,
    pub log: Vec<HealthLogEntry>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Starting,
            failing_streak: 0,
            log: Vec::new(),
        }
    }
}

impl HealthState {
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        read_json(&state_dir.join(HEALTH_FILE))
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        write_json(&state_dir.join(HEALTH_FILE), self)
    }

    /// Fold one probe result into the state.
    ///
    /// Failures inside the start period do not count toward `retries`.
    pub fn record(&mut self, entry: HealthLogEntry, check: &HealthCheck, in_start_period: bool) {
        if entry.exit_code == 0 {
            self.status = HealthStatus::Healthy;
            self.failing_streak = 0;
        } else if !in_start_period {
            self.failing_streak += 1;
            if self.failing_streak >= check.retries.max(1) {
                self.status = HealthStatus::Unhealthy;
            }
        }
        self.log.push(entry);
        if self.log.len() > MAX_LOG_ENTRIES {
            let excess = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
    }
}

impl ContainerManager {
    fn healthcheck<'a>(&self, container: &'a Container) -> Result<(&'a HealthCheck, Vec<String>)> {
        container
            .labels
            .healthcheck
            .as_ref()
            .and_then(|hc| hc.command().map(|cmd| (hc, cmd)))
            .ok_or_else(|| {
                BoxError::Precondition(format!("container {} has no health check", container.name()))
            })
    }

    /// Run the health check once and persist the result.
    pub async fn probe(&self, container: &Container) -> Result<HealthState> {
        let (check, args) = self.healthcheck(container)?;
        let state_dir = self.state_dir(container);
        let mut state = HealthState::load(&state_dir)?.unwrap_or_default();

        let opts = ExecOptions {
            args,
            ..ExecOptions::default()
        };
        let start = Utc::now();
        let timeout = Duration::from_secs(check.timeout_secs.max(1));
        let exit_code = match tokio::time::timeout(timeout, self.exec_in(container, &opts, true)).await {
            Ok(res) => res?,
            Err(_) => {
                tracing::debug!(id = %container.id(), ?timeout, "health probe timed out");
                TIMEOUT_EXIT
            }
        };
        let end = Utc::now();

        let started_at = container.state.started_at.unwrap_or(container.record.created_at);
        let in_start_period = (start - started_at).num_seconds() < check.start_period_secs as i64;
        state.record(HealthLogEntry { start, end, exit_code }, check, in_start_period);
        state.save(&state_dir)?;
        tracing::debug!(id = %container.id(), status = %state.status, exit_code, "health probe");
        Ok(state)
    }

    /// Probe until healthy; fails when the probe reports unhealthy or the
    /// container stops first.
    pub async fn wait_healthy(&self, container: &Container) -> Result<()> {
        let (check, _) = self.healthcheck(container)?;
        let interval = Duration::from_secs(check.interval_secs);
        loop {
            if self.cancel_token().is_cancelled() {
                return Err(BoxError::Cancelled);
            }
            let current = self.reload(container.id()).await?;
            if !current.status().is_live() {
                return Err(BoxError::Precondition(format!(
                    "container {} exited before becoming healthy",
                    container.name()
                )));
            }
            match self.probe(&current).await?.status {
                HealthStatus::Healthy => return Ok(()),
                HealthStatus::Unhealthy => {
                    return Err(BoxError::Precondition(format!(
                        "container {} is unhealthy",
                        container.name()
                    )))
                }
                HealthStatus::Starting => {}
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel_token().cancelled() => return Err(BoxError::Cancelled),
            }
        }
    }
}

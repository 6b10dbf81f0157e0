//! Per-integration circuit breakers.
//!
//! Each external integration (one per posting platform) moves through
//! `Healthy -> Degraded -> Failed -> Recovering -> Healthy`. Only `Failed`
//! blocks attempts; after `recovery_timeout` it admits a limited number of
//! trial attempts as `Recovering`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::config::BreakerConfig;
use crate::error::UnitError;
use crate::vault::Vault;
use crate::vault::unit::write_atomic;

/// File under `<vault>/state/`.
pub const HEALTH_FILE: &str = "health.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    /// Failing, still attempted.
    Degraded,
    /// Not attempted until the recovery timeout elapses.
    Failed,
    /// Admitting a limited number of trial attempts.
    Recovering,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Recovering => "recovering",
        };
        write!(f, "{s}")
    }
}

/// Breaker for one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    state: HealthState,
    failures: u32,
    last_failure: Option<DateTime<Utc>>,
    #[serde(default)]
    trials: u32,
    #[serde(skip)]
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: HealthState::Healthy,
            failures: 0,
            last_failure: None,
            trials: 0,
            config,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.last_failure
    }

    /// Whether an attempt may be made at `now`. Moves `Failed` to
    /// `Recovering` once the timeout has elapsed and counts trial attempts.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            HealthState::Healthy | HealthState::Degraded => true,
            HealthState::Failed => {
                let elapsed = self
                    .last_failure
                    .and_then(|t| (now - t).to_std().ok())
                    .unwrap_or_default();
                if self.last_failure.is_some() && elapsed < self.config.recovery_timeout {
                    return false;
                }
                self.state = HealthState::Recovering;
                self.trials = 1;
                true
            }
            HealthState::Recovering => {
                if self.trials >= self.config.half_open_max_calls {
                    return false;
                }
                self.trials += 1;
                true
            }
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) -> HealthState {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);

        self.state = if self.state == HealthState::Recovering
            || self.failures >= self.config.failure_threshold
        {
            self.trials = 0;
            HealthState::Failed
        } else if self.failures >= self.config.degraded_threshold {
            HealthState::Degraded
        } else {
            self.state
        };
        self.state
    }

    pub fn record_success(&mut self) -> HealthState {
        match self.state {
            HealthState::Recovering | HealthState::Healthy => {
                self.failures = 0;
                self.trials = 0;
                self.state = HealthState::Healthy;
            }
            HealthState::Degraded | HealthState::Failed => {
                // Gradual recovery.
                self.failures = self.failures.saturating_sub(1);
                if self.failures == 0 {
                    self.state = HealthState::Healthy;
                }
            }
        }
        self.state
    }
}

/// Snapshot of one integration for reports.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub state: HealthState,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: OverallHealth,
    pub healthy: usize,
    pub degraded: usize,
    /// Failed or recovering.
    pub failed: usize,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Breakers keyed by integration name, persisted to `state/health.json`.
pub struct HealthRegistry {
    path: PathBuf,
    config: BreakerConfig,
    breakers: Mutex<BTreeMap<String, CircuitBreaker>>,
    audit: AuditLog,
}

impl HealthRegistry {
    /// Load persisted state. A missing file is a fresh registry; an unreadable
    /// one is logged and replaced.
    pub async fn load(vault: &Vault, config: BreakerConfig) -> Self {
        let path = vault.state_dir().join(HEALTH_FILE);
        let breakers = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, CircuitBreaker>>(&bytes) {
                Ok(mut map) => {
                    for breaker in map.values_mut() {
                        breaker.config = config;
                    }
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt health state, starting fresh");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read health state, starting fresh");
                BTreeMap::new()
            }
        };

        Self {
            path,
            config,
            breakers: Mutex::new(breakers),
            audit: AuditLog::new(vault),
        }
    }

    pub async fn allow(&self, component: &str) -> bool {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let before = breaker.state();
        let allowed = breaker.allow(Utc::now());
        let after = breaker.state();

        if before != after {
            self.on_change(component, before, after).await;
            self.persist(&breakers).await;
        }
        allowed
    }

    pub async fn record_failure(&self, component: &str, reason: &str) -> HealthState {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let before = breaker.state();
        let after = breaker.record_failure(Utc::now());
        warn!(component, failures = breaker.failures(), state = %after, reason, "Integration failure");

        if before != after {
            self.on_change(component, before, after).await;
        }
        self.persist(&breakers).await;
        after
    }

    pub async fn record_success(&self, component: &str) -> HealthState {
        let mut breakers = self.breakers.lock().await;
        let Some(breaker) = breakers.get_mut(component) else {
            return HealthState::Healthy;
        };
        let before = breaker.state();
        let after = breaker.record_success();

        if before != after {
            self.on_change(component, before, after).await;
        }
        self.persist(&breakers).await;
        after
    }

    pub async fn state(&self, component: &str) -> HealthState {
        self.breakers
            .lock()
            .await
            .get(component)
            .map(CircuitBreaker::state)
            .unwrap_or_default()
    }

    pub async fn report(&self) -> HealthReport {
        let breakers = self.breakers.lock().await;
        let mut components = BTreeMap::new();
        let (mut healthy, mut degraded, mut failed) = (0, 0, 0);

        for (name, breaker) in breakers.iter() {
            match breaker.state() {
                HealthState::Healthy => healthy += 1,
                HealthState::Degraded => degraded += 1,
                HealthState::Failed | HealthState::Recovering => failed += 1,
            }
            components.insert(
                name.clone(),
                ComponentHealth {
                    state: breaker.state(),
                    failures: breaker.failures(),
                    last_failure: breaker.last_failure(),
                },
            );
        }

        let overall = if failed == 0 {
            OverallHealth::Healthy
        } else if failed < components.len() / 2 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Critical
        };

        HealthReport {
            overall,
            healthy,
            degraded,
            failed,
            components,
        }
    }

    async fn on_change(&self, component: &str, from: HealthState, to: HealthState) {
        match to {
            HealthState::Failed => error!(component, %from, "Integration marked FAILED"),
            HealthState::Healthy => info!(component, %from, "Integration recovered"),
            _ => warn!(component, %from, %to, "Integration health changed"),
        }
        let mut entry = AuditEntry::new(AuditAction::HealthChange, "breaker").details(
            serde_json::json!({ "component": component, "from": from, "to": to }),
        );
        if to == HealthState::Failed {
            entry = entry.failed();
        }
        self.audit.record_or_warn(entry).await;
    }

    async fn persist(&self, breakers: &BTreeMap<String, CircuitBreaker>) {
        if let Err(e) = self.save(breakers).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist health state");
        }
    }

    async fn save(&self, breakers: &BTreeMap<String, CircuitBreaker>) -> Result<(), UnitError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| UnitError::io(dir, e))?;
        }
        let json = serde_json::to_vec_pretty(breakers)?;
        write_atomic(&self.path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config() -> BreakerConfig {
        BreakerConfig {
            degraded_threshold: 2,
            failure_threshold: 4,
            recovery_timeout: Duration::from_secs(600),
            half_open_max_calls: 2,
        }
    }

    #[test]
    fn failures_degrade_then_fail() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Utc::now();

        assert_eq!(breaker.record_failure(now), HealthState::Healthy);
        assert_eq!(breaker.record_failure(now), HealthState::Degraded);
        assert!(breaker.allow(now));
        assert_eq!(breaker.record_failure(now), HealthState::Degraded);
        assert_eq!(breaker.record_failure(now), HealthState::Failed);
        assert!(!breaker.allow(now));
    }

    #[test]
    fn failed_recovers_after_timeout() {
        let mut breaker = CircuitBreaker::new(config());
        let t0 = Utc::now();
        for _ in 0..4 {
            breaker.record_failure(t0);
        }

        assert!(!breaker.allow(t0 + ChronoDuration::seconds(599)));
        let later = t0 + ChronoDuration::seconds(601);
        assert!(breaker.allow(later));
        assert_eq!(breaker.state(), HealthState::Recovering);
        assert!(breaker.allow(later));
        // half_open_max_calls = 2
        assert!(!breaker.allow(later));

        assert_eq!(breaker.record_success(), HealthState::Healthy);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn failure_while_recovering_reopens() {
        let mut breaker = CircuitBreaker::new(config());
        let t0 = Utc::now();
        for _ in 0..4 {
            breaker.record_failure(t0);
        }
        let later = t0 + ChronoDuration::seconds(700);
        assert!(breaker.allow(later));

        assert_eq!(breaker.record_failure(later), HealthState::Failed);
        assert!(!breaker.allow(later + ChronoDuration::seconds(1)));
    }

    #[test]
    fn success_in_degraded_recovers_gradually() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            degraded_threshold: 2,
            failure_threshold: 10,
            ..config()
        });
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        assert_eq!(breaker.state(), HealthState::Degraded);

        assert_eq!(breaker.record_success(), HealthState::Degraded);
        assert_eq!(breaker.failures(), 2);
        assert_eq!(breaker.record_success(), HealthState::Degraded);
        assert_eq!(breaker.record_success(), HealthState::Healthy);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn success_when_healthy_clears_stray_failures() {
        let mut breaker = CircuitBreaker::new(config());
        breaker.record_failure(Utc::now());
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
    }

    #[tokio::test]
    async fn registry_persists_and_reports() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path());

        let registry = HealthRegistry::load(&vault, config()).await;
        assert!(registry.allow("twitter").await);
        for _ in 0..4 {
            registry.record_failure("twitter", "HTTP 503").await;
        }
        assert!(registry.allow("email").await);
        registry.record_success("email").await;
        assert!(!registry.allow("twitter").await);

        let reloaded = HealthRegistry::load(&vault, config()).await;
        assert_eq!(reloaded.state("twitter").await, HealthState::Failed);

        let report = reloaded.report().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.overall, OverallHealth::Critical);
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path());
        tokio::fs::create_dir_all(vault.state_dir()).await.unwrap();
        tokio::fs::write(vault.state_dir().join(HEALTH_FILE), "{not json")
            .await
            .unwrap();

        let registry = HealthRegistry::load(&vault, config()).await;
        assert_eq!(registry.report().await.components.len(), 0);
    }
}

//! Configuration types.
//!
//! Every component receives its configuration explicitly; nothing reads the
//! environment after startup. `VaultConfig::from_env()` is the single place
//! environment variables are interpreted.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Default vault root when `VAULT_PATH` is not set.
pub const DEFAULT_VAULT_PATH: &str = "./AI_Employee_Vault";

/// Engine configuration shared by classifiers, posting workers and producers.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Root directory holding all stage folders.
    pub vault_path: PathBuf,
    /// Agent name used for `In_Progress/<agent>`.
    pub agent: String,
    /// Classifier poll interval.
    pub classify_interval: Duration,
    /// Posting worker poll interval.
    pub post_interval: Duration,
    /// Full inbox rescan interval (fallback for missed change notifications).
    pub inbox_rescan_interval: Duration,
    /// When false, posters validate and log but never touch the network.
    pub live: bool,
    /// Approver allowlist for the approval gate (`*` = anyone, empty = nobody).
    pub approvers: Vec<String>,
    /// Quarantine files reaching `Approved` without a gate stamp.
    pub require_approval_stamp: bool,
    /// Amount ladder thresholds.
    pub approval_limits: ApprovalLimits,
    /// Posting retry policy.
    pub retry: RetryConfig,
    /// Per-integration circuit breaker thresholds.
    pub breaker: BreakerConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            vault_path: PathBuf::from(DEFAULT_VAULT_PATH),
            agent: "local".to_string(),
            classify_interval: Duration::from_secs(30),
            post_interval: Duration::from_secs(60),
            inbox_rescan_interval: Duration::from_secs(300),
            live: false,
            approvers: Vec::new(),
            require_approval_stamp: false,
            approval_limits: ApprovalLimits::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let vault_path = std::env::var("VAULT_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.vault_path);
        let agent = std::env::var("VAULT_AGENT").unwrap_or(defaults.agent);

        let classify_interval = Duration::from_secs(env_parse(
            "VAULT_CLASSIFY_INTERVAL_SECS",
            defaults.classify_interval.as_secs(),
        )?);
        let post_interval = Duration::from_secs(env_parse(
            "VAULT_POST_INTERVAL_SECS",
            defaults.post_interval.as_secs(),
        )?);
        let inbox_rescan_interval = Duration::from_secs(env_parse(
            "VAULT_INBOX_POLL_SECS",
            defaults.inbox_rescan_interval.as_secs(),
        )?);

        let live = env_bool("VAULT_LIVE", false)?;
        let approvers = env_list("VAULT_APPROVERS");
        let require_approval_stamp = env_bool("VAULT_REQUIRE_APPROVAL_STAMP", false)?;

        let approval_limits = ApprovalLimits {
            auto_approve: env_parse("VAULT_AUTO_APPROVE_LIMIT", defaults.approval_limits.auto_approve)?,
            manager: env_parse("VAULT_MANAGER_APPROVE_LIMIT", defaults.approval_limits.manager)?,
        };
        if approval_limits.auto_approve > approval_limits.manager {
            return Err(ConfigError::InvalidValue {
                key: "VAULT_AUTO_APPROVE_LIMIT".into(),
                message: "must not exceed VAULT_MANAGER_APPROVE_LIMIT".into(),
            });
        }

        let retry = RetryConfig {
            max_attempts: env_parse("VAULT_MAX_POST_ATTEMPTS", defaults.retry.max_attempts)?.max(1),
            base_delay: Duration::from_secs(env_parse(
                "VAULT_RETRY_BASE_DELAY_SECS",
                defaults.retry.base_delay.as_secs(),
            )?),
            max_delay: Duration::from_secs(env_parse(
                "VAULT_RETRY_MAX_DELAY_SECS",
                defaults.retry.max_delay.as_secs(),
            )?),
        };

        let failure_threshold: u32 = env_parse(
            "VAULT_BREAKER_FAILURE_THRESHOLD",
            defaults.breaker.failure_threshold,
        )?;
        let breaker = BreakerConfig {
            failure_threshold,
            degraded_threshold: env_parse(
                "VAULT_BREAKER_DEGRADED_THRESHOLD",
                (failure_threshold / 2).max(1),
            )?,
            recovery_timeout: Duration::from_secs(env_parse(
                "VAULT_BREAKER_RECOVERY_SECS",
                defaults.breaker.recovery_timeout.as_secs(),
            )?),
            half_open_max_calls: env_parse(
                "VAULT_BREAKER_HALF_OPEN_CALLS",
                defaults.breaker.half_open_max_calls,
            )?,
        };

        Ok(Self {
            vault_path,
            agent,
            classify_interval,
            post_interval,
            inbox_rescan_interval,
            live,
            approvers,
            require_approval_stamp,
            approval_limits,
            retry,
            breaker,
        })
    }
}

/// Linear approval ladder thresholds (currency units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalLimits {
    /// Amounts strictly below this are auto-approved.
    pub auto_approve: Decimal,
    /// Amounts strictly below this need a manager; at or above, an executive.
    pub manager: Decimal,
}

impl Default for ApprovalLimits {
    fn default() -> Self {
        Self {
            auto_approve: dec!(50),
            manager: dec!(500),
        }
    }
}

/// Posting retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts per file observation (1 = single attempt, no retry).
    pub max_attempts: u32,
    /// First backoff delay; doubled on each further attempt.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Backoff before attempt `attempt` (1-based; attempt 1 has no delay).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before an integration is marked degraded.
    pub degraded_threshold: u32,
    /// Consecutive failures before an integration is marked failed.
    pub failure_threshold: u32,
    /// How long a failed integration stays closed off before probing again.
    pub recovery_timeout: Duration,
    /// Attempts admitted while recovering.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 2,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(600), // 10 minutes
            half_open_max_calls: 3,
        }
    }
}

/// SMTP settings for the email poster.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set (email posting disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_SMTP_HOST").ok()?;
        let port = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Credentials for the REST-based posters. Each is optional; a poster whose
/// credentials are missing reports `NotConfigured` when run live.
#[derive(Debug, Clone, Default)]
pub struct PlatformCredentials {
    pub twitter_bearer_token: Option<SecretString>,
    pub whatsapp_token: Option<SecretString>,
    pub whatsapp_phone_number_id: Option<String>,
    pub instagram_access_token: Option<SecretString>,
    pub instagram_account_id: Option<String>,
}

impl PlatformCredentials {
    pub fn from_env() -> Self {
        let secret = |key: &str| std::env::var(key).ok().map(SecretString::from);
        Self {
            twitter_bearer_token: secret("TWITTER_BEARER_TOKEN"),
            whatsapp_token: secret("WHATSAPP_TOKEN"),
            whatsapp_phone_number_id: std::env::var("WHATSAPP_PHONE_NUMBER_ID").ok(),
            instagram_access_token: secret("INSTAGRAM_ACCESS_TOKEN"),
            instagram_account_id: std::env::var("INSTAGRAM_ACCOUNT_ID").ok(),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

//! Posting worker: drives `Approved` units through their platform poster.
//!
//! Every unit this worker claims ends in exactly one of `Done`, `Failed` or
//! `Quarantine`, with a sidecar in `Logs/`. Units whose platform breaker is
//! open are left in `Approved` untouched for a later pass.
//!
//! A unit still in this worker's `In_Progress` directory when a pass starts
//! was interrupted: if it is stamped `posted` it goes to `Done`, otherwise to
//! `Failed`. It is never posted again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{PostReceipt, Poster, PosterMap};
use crate::approval::is_stamped;
use crate::audit::{AuditAction, AuditEntry, AuditLog, ResultSummary, write_sidecar};
use crate::breaker::HealthRegistry;
use crate::config::{RetryConfig, VaultConfig};
use crate::error::{PostError, QueueError};
use crate::vault::claim::role_agent;
use crate::vault::unit::keys;
use crate::vault::{ClaimManager, Platform, Stage, Vault, platform_of, read_unit, update_metadata};

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostStats {
    pub posted: usize,
    pub failed: usize,
    pub quarantined: usize,
    /// Left in `Approved` because the platform breaker is open.
    pub deferred: usize,
    pub lost_races: usize,
    /// Left in `In_Progress` by an earlier pass and finished now.
    pub recovered: usize,
}

/// How one claimed unit ended.
enum Disposition {
    Posted(PostReceipt),
    Failed(String),
}

pub struct PostingWorker {
    vault: Vault,
    claims: ClaimManager,
    posters: PosterMap,
    health: Arc<HealthRegistry>,
    audit: AuditLog,
    agent: String,
    retry: RetryConfig,
    require_stamp: bool,
}

impl PostingWorker {
    pub fn new(config: &VaultConfig, posters: PosterMap, health: Arc<HealthRegistry>) -> Self {
        let vault = Vault::new(&config.vault_path);
        Self {
            claims: ClaimManager::new(vault.clone()),
            audit: AuditLog::new(&vault),
            posters,
            health,
            agent: role_agent(&config.agent, "poster"),
            retry: config.retry,
            require_stamp: config.require_approval_stamp,
            vault,
        }
    }

    /// Register or replace the poster for its platform.
    pub fn with_poster(mut self, poster: Arc<dyn Poster>) -> Self {
        self.posters.insert(poster.platform(), poster);
        self
    }

    /// One pass over everything currently in `Approved`.
    pub async fn run_once(&self) -> Result<PostStats, QueueError> {
        let mut stats = PostStats {
            recovered: self.recover().await?,
            ..PostStats::default()
        };

        for candidate in self.vault.list(&Stage::Approved).await? {
            let unit = match read_unit(&candidate).await {
                Ok(unit) => unit,
                Err(e) => {
                    // Most likely another worker moved it after the listing.
                    debug!(file = %candidate.display(), error = %e, "Skipping unreadable unit");
                    continue;
                }
            };
            let platform = platform_of(&unit, &candidate);

            if self.require_stamp && !is_stamped(&unit) {
                match self.quarantine_unstamped(&candidate, platform).await {
                    Ok(()) => stats.quarantined += 1,
                    Err(e) => warn!(file = %candidate.display(), error = %e, "Could not quarantine unit"),
                }
                continue;
            }

            let poster = platform.and_then(|p| self.posters.get(&p).cloned());
            if let (Some(platform), Some(_)) = (platform, &poster) {
                if !self.health.allow(&platform.to_string()).await {
                    info!(file = %candidate.display(), %platform, "Platform unavailable, leaving unit in Approved");
                    stats.deferred += 1;
                    continue;
                }
            }

            let claimed = match self.claims.claim(&candidate, &self.agent).await {
                Ok(Some(path)) => path,
                Ok(None) => {
                    stats.lost_races += 1;
                    continue;
                }
                Err(e) => {
                    warn!(file = %candidate.display(), error = %e, "Skipping unit, claim failed");
                    continue;
                }
            };

            let disposition = match (platform, poster) {
                (Some(platform), Some(poster)) => self.attempt(&claimed, platform, poster.as_ref()).await,
                (Some(platform), None) => Disposition::Failed(
                    PostError::UnsupportedPlatform(platform.to_string()).to_string(),
                ),
                (None, _) => Disposition::Failed(
                    PostError::UnsupportedPlatform(unit.get(keys::TYPE).unwrap_or("unknown").to_string())
                        .to_string(),
                ),
            };

            let posted = matches!(disposition, Disposition::Posted(_));
            if posted {
                stats.posted += 1;
            } else {
                stats.failed += 1;
            }
            if let Err(e) = self.finish(&claimed, platform, disposition).await {
                // Still claimed; the next pass finishes it.
                error!(file = %claimed.display(), posted, error = %e, "Could not finalize unit");
            }
        }

        if stats != PostStats::default() {
            info!(
                posted = stats.posted,
                failed = stats.failed,
                quarantined = stats.quarantined,
                deferred = stats.deferred,
                recovered = stats.recovered,
                "Posting pass complete"
            );
        }
        Ok(stats)
    }

    /// Finish units an interrupted pass left claimed. Returns how many were
    /// moved out.
    async fn recover(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for path in self.claims.owned_by(&self.agent).await? {
            match self.recover_one(&path).await {
                Ok(()) => recovered += 1,
                Err(e) => error!(file = %path.display(), error = %e, "Could not recover unit"),
            }
        }
        Ok(recovered)
    }

    async fn recover_one(&self, path: &Path) -> crate::Result<()> {
        let unit = read_unit(path).await?;
        let platform = platform_of(&unit, path);

        let summary = match unit.get_nonempty(keys::STATUS) {
            Some("posted") => {
                let dest = self.claims.release(path, &Stage::Done).await?;
                info!(file = %dest.display(), "Recovered posted unit");
                ResultSummary::success(&dest, &Stage::Done)
                    .with_external_id(unit.get_nonempty("external_id").map(String::from))
            }
            Some("failed") => {
                let message = unit.get_nonempty(keys::ERROR).unwrap_or("Posting failed").to_string();
                let dest = self.claims.release(path, &Stage::Failed).await?;
                ResultSummary::failure(&dest, &Stage::Failed, message)
            }
            Some("quarantined") => {
                let reason = unit.get_nonempty("quarantine_reason").unwrap_or("Quarantined").to_string();
                let dest = self.claims.release(path, &Stage::Quarantine).await?;
                ResultSummary::failure(&dest, &Stage::Quarantine, reason)
            }
            _ => {
                let message = "Interrupted during posting; delivery state unknown, not retried";
                let dest = self.move_to_failed(path, message).await?;
                ResultSummary::failure(&dest, &Stage::Failed, message)
            }
        };
        write_sidecar(&self.vault, &summary.with_platform(platform).with_agent(&self.agent)).await?;
        Ok(())
    }

    /// Validate then post with bounded retries.
    async fn attempt(&self, claimed: &Path, platform: Platform, poster: &dyn Poster) -> Disposition {
        let unit = match read_unit(claimed).await {
            Ok(unit) => unit,
            Err(e) => return Disposition::Failed(e.to_string()),
        };
        if let Err(e) = poster.validate(&unit) {
            warn!(file = %claimed.display(), %platform, error = %e, "Unit failed validation");
            return Disposition::Failed(e.to_string());
        }

        let component = platform.to_string();
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                if !self.health.allow(&component).await {
                    warn!(%platform, attempt, "Breaker opened, no further attempts");
                    break;
                }
                tokio::time::sleep(self.retry.delay_before(attempt)).await;
            }

            let result = poster.post(&unit).await;
            self.audit
                .record_or_warn(self.attempt_entry(claimed, platform, attempt, &result))
                .await;

            match result {
                Ok(receipt) => {
                    self.health.record_success(&component).await;
                    return Disposition::Posted(receipt);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if matches!(e, PostError::MissingField(_) | PostError::NotConfigured { .. }) {
                        break;
                    }
                    self.health.record_failure(&component, &last_error).await;
                    if !e.is_retryable() {
                        break;
                    }
                    if let PostError::Unavailable {
                        retry_after: Some(wait),
                        ..
                    } = e
                    {
                        if attempt < self.retry.max_attempts {
                            tokio::time::sleep(wait.min(self.retry.max_delay)).await;
                        }
                    }
                    warn!(file = %claimed.display(), %platform, attempt, error = %last_error, "Post attempt failed");
                }
            }
        }
        Disposition::Failed(last_error)
    }

    fn attempt_entry(
        &self,
        claimed: &Path,
        platform: Platform,
        attempt: u32,
        result: &Result<PostReceipt, PostError>,
    ) -> AuditEntry {
        let entry = AuditEntry::new(AuditAction::PostAttempt, &self.agent).file(claimed);
        match result {
            Ok(receipt) => entry.details(json!({
                "platform": platform,
                "attempt": attempt,
                "external_id": receipt.external_id,
                "dry_run": receipt.dry_run,
            })),
            Err(e) => entry
                .details(json!({ "platform": platform, "attempt": attempt, "error": e.to_string() }))
                .failed(),
        }
    }

    /// Stamp, move to a terminal stage and write the sidecar.
    async fn finish(
        &self,
        claimed: &Path,
        platform: Option<Platform>,
        disposition: Disposition,
    ) -> crate::Result<()> {
        let summary = match disposition {
            Disposition::Posted(receipt) => {
                let mut patch = vec![
                    (keys::STATUS, "posted".to_string()),
                    ("posted_at", Utc::now().to_rfc3339()),
                ];
                if let Some(id) = &receipt.external_id {
                    patch.push(("external_id", id.clone()));
                }
                if let Some(url) = &receipt.url {
                    patch.push(("post_url", url.clone()));
                }
                if receipt.dry_run {
                    patch.push(("dry_run", "true".to_string()));
                }
                // A sent unit goes to Done even when the stamp cannot be written.
                if let Err(e) = update_metadata(claimed, patch).await {
                    error!(file = %claimed.display(), error = %e, "Could not stamp posted unit");
                }
                let dest = self.claims.release(claimed, &Stage::Done).await?;
                info!(file = %dest.display(), platform = ?platform, dry_run = receipt.dry_run, "Unit posted");
                ResultSummary::success(&dest, &Stage::Done).with_external_id(receipt.external_id)
            }
            Disposition::Failed(message) => {
                let dest = self.move_to_failed(claimed, &message).await?;
                ResultSummary::failure(&dest, &Stage::Failed, message)
            }
        };

        write_sidecar(&self.vault, &summary.with_platform(platform).with_agent(&self.agent)).await?;
        Ok(())
    }

    async fn move_to_failed(&self, claimed: &Path, message: &str) -> crate::Result<PathBuf> {
        update_metadata(
            claimed,
            [
                (keys::STATUS, "failed".to_string()),
                (keys::ERROR, message.to_string()),
            ],
        )
        .await?;
        let dest = self.claims.release(claimed, &Stage::Failed).await?;
        error!(file = %dest.display(), error = message, "Posting failed");
        self.audit
            .record_or_warn(
                AuditEntry::new(AuditAction::Error, &self.agent)
                    .file(&dest)
                    .details(json!({ "error": message }))
                    .failed(),
            )
            .await;
        Ok(dest)
    }

    async fn quarantine_unstamped(&self, file: &Path, platform: Option<Platform>) -> crate::Result<()> {
        let Some(claimed) = self.claims.claim(file, &self.agent).await? else {
            return Ok(());
        };
        let reason = "Reached Approved without an approval stamp";
        update_metadata(
            &claimed,
            [
                (keys::STATUS, "quarantined".to_string()),
                ("quarantine_reason", reason.to_string()),
            ],
        )
        .await?;
        let dest = self.claims.release(&claimed, &Stage::Quarantine).await?;
        warn!(file = %dest.display(), "Unstamped unit quarantined");

        let summary = ResultSummary::failure(&dest, &Stage::Quarantine, reason)
            .with_platform(platform)
            .with_agent(&self.agent);
        write_sidecar(&self.vault, &summary).await?;
        self.audit
            .record_or_warn(
                AuditEntry::new(AuditAction::StageTransition, &self.agent)
                    .file(&dest)
                    .details(json!({ "to": Stage::Quarantine.to_string(), "reason": reason }))
                    .failed(),
            )
            .await;
        Ok(())
    }
}

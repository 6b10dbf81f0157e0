//! Classifier: claims units from `Needs_Action` and routes each one forward.
//!
//! For each claimed unit:
//! 1. Triage rules may quarantine or archive it outright.
//! 2. Financial items are scored on the amount ladder; small amounts are
//!    auto-approved, the rest wait for a human with `approval_level` set.
//! 3. Inbound email with a sender gets a reply draft in
//!    `Pending_Approval/Email`; the source is released to `Done`.
//! 4. Anything else waits in `Pending_Approval/<platform>`.
//!
//! A failure on one unit moves it to `Failed` and the pass continues. Units
//! an interrupted pass left in this classifier's `In_Progress` directory are
//! moved to `Failed` at the start of the next pass.

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

use super::amounts::{ApprovalLadder, ApprovalLevel, extract_amounts};
use super::drafts::{self, DRAFT_FILE};
use super::rules::{Category, Route, TriageInput, TriageRules, categorize, priority};
use crate::approval::ApprovalGate;
use crate::audit::{AuditAction, AuditEntry, AuditLog, ResultSummary, write_sidecar};
use crate::config::VaultConfig;
use crate::error::{QueueError, Result};
use crate::vault::unit::keys;
use crate::vault::claim::role_agent;
use crate::vault::{
    ClaimManager, GENERAL_BUCKET, Platform, Stage, UnitFile, Vault, platform_of, read_unit,
    update_metadata,
};

/// Rule name stamped on auto-approved units.
pub const AUTO_APPROVE_RULE: &str = "amount-under-limit";

/// Where one unit ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Quarantined { reason: String },
    Archived { reason: String },
    AutoApproved,
    AwaitingApproval { bucket: String },
    Drafted { draft: PathBuf },
}

impl Outcome {
    fn stage(&self) -> Stage {
        match self {
            Self::Quarantined { .. } => Stage::Quarantine,
            Self::Archived { .. } | Self::Drafted { .. } => Stage::Done,
            Self::AutoApproved => Stage::Approved,
            Self::AwaitingApproval { bucket } => Stage::PendingApproval(bucket.clone()),
        }
    }
}

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    pub processed: usize,
    pub quarantined: usize,
    pub archived: usize,
    pub auto_approved: usize,
    pub awaiting_approval: usize,
    pub drafted: usize,
    pub failed: usize,
    /// Left in `In_Progress` by an earlier pass and moved to `Failed`.
    pub recovered: usize,
    /// Listed but claimed by someone else first.
    pub lost_races: usize,
}

pub struct Classifier {
    vault: Vault,
    claims: ClaimManager,
    gate: ApprovalGate,
    rules: TriageRules,
    ladder: ApprovalLadder,
    audit: AuditLog,
    agent: String,
}

impl Classifier {
    pub fn new(config: &VaultConfig) -> Self {
        let vault = Vault::new(&config.vault_path);
        Self {
            claims: ClaimManager::new(vault.clone()),
            gate: ApprovalGate::new(vault.clone(), config.approvers.clone()),
            rules: TriageRules::default_rules(),
            ladder: ApprovalLadder::new(config.approval_limits),
            audit: AuditLog::new(&vault),
            agent: role_agent(&config.agent, "classifier"),
            vault,
        }
    }

    pub fn with_rules(mut self, rules: TriageRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Claim and process everything currently in `Needs_Action`.
    pub async fn run_once(&self) -> std::result::Result<ClassifyStats, QueueError> {
        let mut stats = ClassifyStats {
            recovered: self.recover().await?,
            ..ClassifyStats::default()
        };

        for candidate in self.claims.list_available().await? {
            let claimed = match self.claims.claim(&candidate, &self.agent).await {
                Ok(Some(path)) => path,
                Ok(None) => {
                    stats.lost_races += 1;
                    continue;
                }
                Err(e) => {
                    // Left where it was; the next pass retries.
                    warn!(file = %candidate.display(), error = %e, "Skipping unit, claim failed");
                    continue;
                }
            };

            stats.processed += 1;
            match self.process_one(&claimed).await {
                Ok(outcome) => match outcome {
                    Outcome::Quarantined { .. } => stats.quarantined += 1,
                    Outcome::Archived { .. } => stats.archived += 1,
                    Outcome::AutoApproved => stats.auto_approved += 1,
                    Outcome::AwaitingApproval { .. } => stats.awaiting_approval += 1,
                    Outcome::Drafted { .. } => stats.drafted += 1,
                },
                Err(e) => {
                    stats.failed += 1;
                    error!(file = %claimed.display(), error = %e, "Classification failed");
                    self.fail(&claimed, &e.to_string()).await;
                }
            }
        }

        if stats.processed > 0 || stats.recovered > 0 {
            info!(
                processed = stats.processed,
                recovered = stats.recovered,
                quarantined = stats.quarantined,
                archived = stats.archived,
                auto_approved = stats.auto_approved,
                awaiting_approval = stats.awaiting_approval,
                drafted = stats.drafted,
                failed = stats.failed,
                "Classifier pass complete"
            );
        }
        Ok(stats)
    }

    /// Fail whatever an interrupted pass left claimed.
    async fn recover(&self) -> std::result::Result<usize, QueueError> {
        let leftovers = self.claims.owned_by(&self.agent).await?;
        for path in &leftovers {
            warn!(file = %path.display(), "Unit left in progress by an earlier pass");
            self.fail(path, "Interrupted before classification finished").await;
        }
        Ok(leftovers.len())
    }

    /// Route one unit this agent already owns. Writes the sidecar and audit
    /// entry for the outcome.
    pub async fn process_one(&self, claimed: &Path) -> Result<Outcome> {
        let unit = read_unit(claimed).await?;
        if !unit.has_header() {
            warn!(file = %claimed.display(), "Unit has no metadata header");
        }

        let sender = unit
            .get_nonempty("from")
            .or_else(|| unit.get_nonempty("sender"));
        let subject = unit.get_nonempty("subject");
        let input = TriageInput {
            sender,
            subject,
            content: unit.body(),
        };
        let platform = platform_of(&unit, claimed);

        let (outcome, dest) = match self.rules.evaluate(&input) {
            Some(Route::Quarantine { reason }) => {
                update_metadata(
                    claimed,
                    [
                        (keys::STATUS, "quarantined".to_string()),
                        ("quarantine_reason", reason.clone()),
                    ],
                )
                .await?;
                let dest = self.claims.release(claimed, &Stage::Quarantine).await?;
                (Outcome::Quarantined { reason }, dest)
            }
            Some(Route::Archive { reason }) => {
                update_metadata(
                    claimed,
                    [
                        (keys::STATUS, "archived".to_string()),
                        ("archive_reason", reason.clone()),
                    ],
                )
                .await?;
                let dest = self.claims.release(claimed, &Stage::Done).await?;
                (Outcome::Archived { reason }, dest)
            }
            None => self.classify(claimed, &unit, sender, subject, platform).await?,
        };

        let summary = match &outcome {
            Outcome::Quarantined { reason } => {
                ResultSummary::failure(&dest, &outcome.stage(), format!("Quarantined: {reason}"))
            }
            _ => ResultSummary::success(&dest, &outcome.stage()),
        }
        .with_platform(platform)
        .with_agent(&self.agent);
        write_sidecar(&self.vault, &summary).await?;

        let mut entry = AuditEntry::new(AuditAction::StageTransition, &self.agent)
            .file(&dest)
            .details(json!({ "to": outcome.stage().to_string(), "outcome": format!("{outcome:?}") }));
        if matches!(outcome, Outcome::Quarantined { .. }) {
            entry = entry.failed();
        }
        self.audit.record_or_warn(entry).await;

        Ok(outcome)
    }

    async fn classify(
        &self,
        claimed: &Path,
        unit: &UnitFile,
        sender: Option<&str>,
        subject: Option<&str>,
        platform: Option<Platform>,
    ) -> Result<(Outcome, PathBuf)> {
        let text = format!("{}\n{}", subject.unwrap_or_default(), unit.body());
        let category = categorize(&text);

        let mut patch = vec![("category", category.as_str().to_string())];
        if unit.get_nonempty(keys::PRIORITY).is_none() {
            patch.push((keys::PRIORITY, priority(&text).to_string()));
        }

        if category == Category::Financial {
            let mut amounts = extract_amounts(&text);
            if let Some(declared) = unit.get_nonempty("amount").and_then(|a| {
                a.trim_start_matches(['$', '€', '£', '¥'])
                    .replace(',', "")
                    .parse::<Decimal>()
                    .ok()
            }) {
                amounts.push(declared);
            }
            let level = self.ladder.level(&amounts);
            patch.push(("approval_level", level.to_string()));
            if let Some(max) = amounts.iter().max() {
                patch.push(("amount", max.to_string()));
            }

            if level == ApprovalLevel::AutoApprove {
                update_metadata(claimed, patch).await?;
                let dest = self.gate.auto_approve(claimed, AUTO_APPROVE_RULE).await?;
                return Ok((Outcome::AutoApproved, dest));
            }
            return self.await_approval(claimed, patch, platform).await;
        }

        let is_email = unit
            .get(keys::TYPE)
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("email"));
        if let (true, Some(sender)) = (is_email, sender) {
            let source_name = claimed
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let draft = drafts::email_reply(
                &source_name,
                sender,
                subject.unwrap_or("(no subject)"),
                unit.body(),
            );
            let draft_path = self
                .vault
                .insert_unit(&Stage::pending(Some(Platform::Email)), "email_reply_draft", &draft)
                .await?;

            patch.push((keys::STATUS, "drafted".to_string()));
            patch.push((
                DRAFT_FILE,
                draft_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ));
            let released = async {
                update_metadata(claimed, patch).await?;
                Ok::<_, crate::Error>(self.claims.release(claimed, &Stage::Done).await?)
            }
            .await;
            let dest = match released {
                Ok(dest) => dest,
                Err(e) => {
                    // The source goes to Failed; its draft must not stay approvable.
                    if let Err(undo) = tokio::fs::remove_file(&draft_path).await {
                        error!(draft = %draft_path.display(), error = %undo, "Could not withdraw reply draft");
                    }
                    return Err(e);
                }
            };

            info!(source = %source_name, draft = %draft_path.display(), "Email reply drafted");
            return Ok((Outcome::Drafted { draft: draft_path }, dest));
        }

        self.await_approval(claimed, patch, platform).await
    }

    async fn await_approval(
        &self,
        claimed: &Path,
        mut patch: Vec<(&'static str, String)>,
        platform: Option<Platform>,
    ) -> Result<(Outcome, PathBuf)> {
        let bucket = platform
            .map(|p| p.dir_name().to_string())
            .unwrap_or_else(|| GENERAL_BUCKET.to_string());
        patch.push((keys::STATUS, "pending_approval".to_string()));
        update_metadata(claimed, patch).await?;
        let dest = self
            .claims
            .release(claimed, &Stage::PendingApproval(bucket.clone()))
            .await?;
        Ok((Outcome::AwaitingApproval { bucket }, dest))
    }

    /// Best effort: record the error, move to `Failed`, write a sidecar.
    async fn fail(&self, claimed: &Path, message: &str) {
        if let Err(e) = update_metadata(
            claimed,
            [
                (keys::STATUS, "failed".to_string()),
                (keys::ERROR, message.to_string()),
            ],
        )
        .await
        {
            warn!(file = %claimed.display(), error = %e, "Could not record error on unit");
        }

        let dest = match self.claims.release(claimed, &Stage::Failed).await {
            Ok(dest) => dest,
            Err(e) => {
                error!(file = %claimed.display(), error = %e, "Could not move unit to Failed");
                claimed.to_path_buf()
            }
        };

        let summary = ResultSummary::failure(&dest, &Stage::Failed, message).with_agent(&self.agent);
        if let Err(e) = write_sidecar(&self.vault, &summary).await {
            warn!(error = %e, "Could not write failure sidecar");
        }
        self.audit
            .record_or_warn(
                AuditEntry::new(AuditAction::Error, &self.agent)
                    .file(&dest)
                    .details(json!({ "error": message }))
                    .failed(),
            )
            .await;
    }
}

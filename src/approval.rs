//! Approval gate between `Pending_Approval/*` and `Approved` / `Rejected`.
//!
//! A file in `Approved` is an instruction to perform an irreversible external
//! action, so decisions made through the gate are checked against an
//! approver allowlist and stamped into the unit's header before the move.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::error::{ApprovalError, Result};
use crate::vault::unit::keys;
use crate::vault::{Stage, UnitFile, Vault, update_metadata};

/// Header keys written by the gate.
pub mod stamp {
    pub const APPROVED_BY: &str = "approved_by";
    pub const REJECTED_BY: &str = "rejected_by";
    pub const DECIDED_AT: &str = "decided_at";
    pub const REJECTION_REASON: &str = "rejection_reason";
    /// Prefix of `approved_by` for rule-based approvals.
    pub const AUTO_PREFIX: &str = "auto:";
}

pub struct ApprovalGate {
    vault: Vault,
    approvers: Vec<String>,
    audit: AuditLog,
}

impl ApprovalGate {
    pub fn new(vault: Vault, approvers: Vec<String>) -> Self {
        let audit = AuditLog::new(&vault);
        Self {
            vault,
            approvers,
            audit,
        }
    }

    pub fn is_authorized(&self, approver: &str) -> bool {
        is_approver_allowed(&self.approvers, approver)
    }

    /// Stamp and move a pending unit into `Approved`.
    pub async fn approve(&self, file: &Path, approver: &str) -> Result<PathBuf> {
        self.check(file, approver)?;

        update_metadata(
            file,
            [
                (keys::STATUS, "approved".to_string()),
                (stamp::APPROVED_BY, approver.to_string()),
                (stamp::DECIDED_AT, Utc::now().to_rfc3339()),
            ],
        )
        .await?;
        let dest = self.vault.move_to_stage(file, &Stage::Approved).await?;

        info!(file = %dest.display(), approver, "Approved");
        self.audit
            .record_or_warn(
                AuditEntry::new(AuditAction::ApprovalGranted, approver)
                    .file(&dest)
                    .details(json!({ "from": self.vault.stage_of(file).map(|s| s.to_string()) })),
            )
            .await;
        Ok(dest)
    }

    /// Stamp and move a pending unit into `Rejected`. Rejected units are kept
    /// for audit and never acted on.
    pub async fn reject(&self, file: &Path, approver: &str, reason: Option<&str>) -> Result<PathBuf> {
        self.check(file, approver)?;

        let mut patch = vec![
            (keys::STATUS, "rejected".to_string()),
            (stamp::REJECTED_BY, approver.to_string()),
            (stamp::DECIDED_AT, Utc::now().to_rfc3339()),
        ];
        if let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) {
            patch.push((stamp::REJECTION_REASON, reason.to_string()));
        }
        update_metadata(file, patch).await?;
        let dest = self.vault.move_to_stage(file, &Stage::Rejected).await?;

        info!(file = %dest.display(), approver, reason = reason.unwrap_or(""), "Rejected");
        self.audit
            .record_or_warn(
                AuditEntry::new(AuditAction::ApprovalRejected, approver)
                    .file(&dest)
                    .details(json!({ "reason": reason })),
            )
            .await;
        Ok(dest)
    }

    /// Rule-based approval, bypassing the allowlist. Used by the classifier
    /// for items under the auto-approve limit.
    pub async fn auto_approve(&self, file: &Path, rule: &str) -> Result<PathBuf> {
        let approver = format!("{}{}", stamp::AUTO_PREFIX, rule);
        update_metadata(
            file,
            [
                (keys::STATUS, "approved".to_string()),
                (stamp::APPROVED_BY, approver.clone()),
                (stamp::DECIDED_AT, Utc::now().to_rfc3339()),
            ],
        )
        .await?;
        let dest = self.vault.move_to_stage(file, &Stage::Approved).await?;

        info!(file = %dest.display(), rule, "Auto-approved");
        self.audit
            .record_or_warn(
                AuditEntry::new(AuditAction::ApprovalGranted, approver)
                    .file(&dest)
                    .details(json!({ "rule": rule })),
            )
            .await;
        Ok(dest)
    }

    fn check(&self, file: &Path, approver: &str) -> std::result::Result<(), ApprovalError> {
        match self.vault.stage_of(file) {
            Some(Stage::PendingApproval(_)) => {}
            _ => return Err(ApprovalError::NotPending(file.to_path_buf())),
        }
        if !self.is_authorized(approver) {
            warn!(approver, file = %file.display(), "Unauthorized approval attempt");
            return Err(ApprovalError::Unauthorized {
                approver: approver.to_string(),
            });
        }
        Ok(())
    }
}

/// Whether a unit carries an approval stamp from the gate.
pub fn is_stamped(unit: &UnitFile) -> bool {
    unit.get_nonempty(stamp::APPROVED_BY).is_some()
        && unit
            .get(keys::STATUS)
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("approved"))
}

/// Allowlist check. Empty allows nobody and `*` allows anyone. Entries are
/// names or addresses (case-insensitive), `@example.com` or `example.com`
/// matches any address at that domain.
pub fn is_approver_allowed(allowed: &[String], approver: &str) -> bool {
    let approver = approver.trim();
    if allowed.is_empty() || approver.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let approver_lower = approver.to_lowercase();
    allowed.iter().any(|a| {
        if a.eq_ignore_ascii_case(approver) {
            true
        } else if a.starts_with('@') {
            approver_lower.ends_with(&a.to_lowercase())
        } else if !a.contains('@') && approver.contains('@') {
            approver_lower.ends_with(&format!("@{}", a.to_lowercase()))
        } else {
            false
        }
    })
}

//! Claim manager: at-most-one ownership of unit files via stage moves.
//!
//! Two agents that listed the same file race on removing its old name; the
//! loser sees the source gone and gets `Ok(None)`. The window between listing
//! and claiming is not closed, so callers must treat a claim as fallible and
//! move on to another file.
//!
//! Background workers claim under a role-scoped name (`<agent>-<role>`). A
//! role is the only writer of its directory, so anything found there when a
//! pass starts was left behind by an interrupted pass.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use super::{Stage, Vault};
use crate::error::QueueError;

/// Grants exclusive ownership of units by moving them into
/// `In_Progress/<agent>/`.
#[derive(Debug, Clone)]
pub struct ClaimManager {
    vault: Vault,
}

impl ClaimManager {
    pub fn new(vault: Vault) -> Self {
        Self { vault }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Move `task_file` into `In_Progress/<agent>/`.
    ///
    /// Returns `Ok(None)` when the file vanished before the move (another
    /// agent won). Any other failure is logged and returned; nothing is
    /// retried here.
    pub async fn claim(&self, task_file: &Path, agent: &str) -> Result<Option<PathBuf>, QueueError> {
        validate_agent(agent)?;
        let target = Stage::InProgress(agent.to_string());

        match self.vault.move_to_stage(task_file, &target).await {
            Ok(path) => {
                info!(agent, file = %path.display(), "Claimed unit");
                Ok(Some(path))
            }
            Err(QueueError::SourceMissing(_)) => {
                debug!(agent, file = %task_file.display(), "Unit already claimed elsewhere");
                Ok(None)
            }
            Err(e) => {
                error!(agent, file = %task_file.display(), error = %e, "Claim failed");
                Err(e)
            }
        }
    }

    /// Move a unit, typically out of `In_Progress`, into `destination`.
    pub async fn release(&self, task_file: &Path, destination: &Stage) -> Result<PathBuf, QueueError> {
        let path = self.vault.move_to_stage(task_file, destination).await?;
        debug!(file = %path.display(), to = %destination, "Released unit");
        Ok(path)
    }

    /// Snapshot of `Needs_Action`. Entries may already be gone when claimed.
    pub async fn list_available(&self) -> Result<Vec<PathBuf>, QueueError> {
        self.vault.list(&Stage::NeedsAction).await
    }

    /// Claim the first available unit that is still there.
    pub async fn claim_next(&self, agent: &str) -> Result<Option<PathBuf>, QueueError> {
        for candidate in self.list_available().await? {
            if let Some(claimed) = self.claim(&candidate, agent).await? {
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    /// Units currently owned by `agent`.
    pub async fn owned_by(&self, agent: &str) -> Result<Vec<PathBuf>, QueueError> {
        validate_agent(agent)?;
        self.vault.list(&Stage::InProgress(agent.to_string())).await
    }
}

/// Claim directory name for one worker role of `agent`, e.g. `local-poster`.
pub fn role_agent(agent: &str, role: &str) -> String {
    format!("{agent}-{role}")
}

/// Agent names become a directory component.
pub fn validate_agent(agent: &str) -> Result<(), QueueError> {
    let bad = agent.trim().is_empty()
        || agent != agent.trim()
        || agent == "."
        || agent == ".."
        || agent.contains(['/', '\\', '\0']);
    if bad {
        return Err(QueueError::InvalidAgent(agent.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ClaimManager) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout().await.unwrap();
        (dir, ClaimManager::new(vault))
    }

    async fn drop_task(claims: &ClaimManager, name: &str) -> PathBuf {
        let path = claims.vault().stage_dir(&Stage::NeedsAction).join(name);
        tokio::fs::write(&path, "---\ntype: task\n---\nbody\n")
            .await
            .unwrap();
        path
    }

    #[tokio::test]
    async fn claim_moves_into_agent_dir() {
        let (_dir, claims) = setup().await;
        let task = drop_task(&claims, "TASK_1.md").await;

        let claimed = claims.claim(&task, "cloud").await.unwrap().unwrap();
        assert!(claimed.ends_with("In_Progress/cloud/TASK_1.md"));
        assert!(!task.exists());
        assert!(claims.list_available().await.unwrap().is_empty());
        assert_eq!(claims.owned_by("cloud").await.unwrap(), vec![claimed]);
    }

    #[tokio::test]
    async fn second_claim_returns_none() {
        let (_dir, claims) = setup().await;
        let task = drop_task(&claims, "TASK_1.md").await;

        assert!(claims.claim(&task, "a").await.unwrap().is_some());
        assert!(claims.claim(&task, "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_moves_to_destination() {
        let (_dir, claims) = setup().await;
        let task = drop_task(&claims, "TASK_1.md").await;
        let claimed = claims.claim(&task, "a").await.unwrap().unwrap();

        let done = claims.release(&claimed, &Stage::Done).await.unwrap();
        assert!(done.ends_with("Done/TASK_1.md"));
        assert!(claims.owned_by("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_next_skips_to_remaining_file() {
        let (_dir, claims) = setup().await;
        let first = drop_task(&claims, "A.md").await;
        drop_task(&claims, "B.md").await;

        // Another agent takes A between our listing and claim.
        claims.claim(&first, "other").await.unwrap();

        let got = claims.claim_next("me").await.unwrap().unwrap();
        assert!(got.ends_with("In_Progress/me/B.md"));
        assert!(claims.claim_next("me").await.unwrap().is_none());
    }

    #[test]
    fn role_agents_are_valid_and_distinct() {
        let poster = role_agent("local", "poster");
        assert_eq!(poster, "local-poster");
        assert!(validate_agent(&poster).is_ok());
        assert_ne!(poster, role_agent("local", "classifier"));
    }

    #[tokio::test]
    async fn invalid_agent_names_rejected() {
        let (_dir, claims) = setup().await;
        let task = drop_task(&claims, "TASK_1.md").await;

        for agent in ["", "..", "a/b", " padded"] {
            let err = claims.claim(&task, agent).await.unwrap_err();
            assert!(matches!(err, QueueError::InvalidAgent(_)));
        }
        assert!(task.exists());
    }
}

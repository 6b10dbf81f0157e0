//! Result-summary sidecars and the append-only audit log, both under `Logs/`.
//!
//! A sidecar is one JSON document per processed unit,
//! `<stem>.<YYYYMMDDTHHMMSS>.result.json`, and is the user-facing record of
//! what happened to a file that ended up in `Failed` or `Quarantine`. The
//! audit log is JSON Lines, one file per day (`audit_<YYYYMMDD>.jsonl`).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::UnitError;
use crate::vault::{Platform, Stage, Vault};

/// Outcome record written next to every processed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub timestamp: DateTime<Utc>,
    pub source_file: String,
    pub destination_stage: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl ResultSummary {
    pub fn success(source: &Path, destination: &Stage) -> Self {
        Self::new(source, destination, true, None)
    }

    pub fn failure(source: &Path, destination: &Stage, error: impl Into<String>) -> Self {
        Self::new(source, destination, false, Some(error.into()))
    }

    fn new(source: &Path, destination: &Stage, success: bool, error: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source_file: source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| source.display().to_string()),
            destination_stage: destination.to_string(),
            success,
            error,
            platform: None,
            external_id: None,
            agent: None,
        }
    }

    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_external_id(mut self, id: Option<String>) -> Self {
        self.external_id = id;
        self
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }
}

/// Write `summary` as a new sidecar in `<vault>/Logs/`. Never overwrites an
/// earlier sidecar for the same file.
pub async fn write_sidecar(vault: &Vault, summary: &ResultSummary) -> Result<PathBuf, UnitError> {
    let logs = vault.logs_dir();
    fs::create_dir_all(&logs)
        .await
        .map_err(|e| UnitError::io(&logs, e))?;

    let stem = Path::new(&summary.source_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unit".to_string());
    let stamp = summary.timestamp.format("%Y%m%dT%H%M%S");
    let json = serde_json::to_vec_pretty(summary)?;

    let mut n = 0u32;
    loop {
        let name = if n == 0 {
            format!("{stem}.{stamp}.result.json")
        } else {
            format!("{stem}.{stamp}_{n}.result.json")
        };
        let path = logs.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(mut file) => {
                file.write_all(&json)
                    .await
                    .map_err(|e| UnitError::io(&path, e))?;
                file.flush().await.map_err(|e| UnitError::io(&path, e))?;
                debug!(sidecar = %path.display(), success = summary.success, "Wrote result summary");
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(UnitError::io(&path, e)),
        }
    }
}

/// Sidecars previously written for a unit file name, oldest first.
pub async fn sidecars_for(vault: &Vault, file_name: &str) -> Result<Vec<ResultSummary>, UnitError> {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!("{stem}.");
    let logs = vault.logs_dir();

    let mut entries = match fs::read_dir(&logs).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(UnitError::io(&logs, e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| UnitError::io(&logs, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".result.json") {
            let bytes = fs::read(entry.path())
                .await
                .map_err(|e| UnitError::io(entry.path(), e))?;
            found.push(serde_json::from_slice::<ResultSummary>(&bytes)?);
        }
    }
    found.sort_by_key(|s| s.timestamp);
    Ok(found)
}

/// Kind of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    UnitCreated,
    StageTransition,
    ApprovalGranted,
    ApprovalRejected,
    PostAttempt,
    HealthChange,
    Error,
}

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub success: bool,
}

impl AuditEntry {
    pub fn new(action: AuditAction, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            actor: actor.into(),
            file: None,
            details: serde_json::Value::Null,
            success: true,
        }
    }

    pub fn file(mut self, path: &Path) -> Self {
        self.file = path.file_name().map(|n| n.to_string_lossy().into_owned());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Per-day counts from the audit log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DailySummary {
    pub date: Option<NaiveDate>,
    pub total: usize,
    pub failures: usize,
    pub by_action: BTreeMap<AuditAction, usize>,
}

/// Append-only JSON Lines audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(vault: &Vault) -> Self {
        Self {
            dir: vault.logs_dir(),
        }
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit_{}.jsonl", date.format("%Y%m%d")))
    }

    /// Append one entry. Logging failures are reported, not swallowed.
    pub async fn record(&self, entry: AuditEntry) -> Result<(), UnitError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UnitError::io(&self.dir, e))?;

        let path = self.file_for(entry.timestamp.date_naive());
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| UnitError::io(&path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| UnitError::io(&path, e))?;
        Ok(())
    }

    /// Record, downgrading a failure to a warning. For use inside loops where
    /// an audit failure must not stop processing.
    pub async fn record_or_warn(&self, entry: AuditEntry) {
        let action = entry.action;
        if let Err(e) = self.record(entry).await {
            warn!(?action, error = %e, "Failed to write audit entry");
        }
    }

    /// Entries for one day. Unparseable lines are skipped.
    pub async fn entries(&self, date: NaiveDate) -> Result<Vec<AuditEntry>, UnitError> {
        let path = self.file_for(date);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UnitError::io(&path, e)),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    pub async fn daily_summary(&self, date: NaiveDate) -> Result<DailySummary, UnitError> {
        let entries = self.entries(date).await?;
        let mut summary = DailySummary {
            date: Some(date),
            ..DailySummary::default()
        };
        for entry in entries {
            summary.total += 1;
            if !entry.success {
                summary.failures += 1;
            }
            *summary.by_action.entry(entry.action).or_default() += 1;
        }
        Ok(summary)
    }
}

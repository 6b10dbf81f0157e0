//! The vault: a directory tree whose folders are the lifecycle stages of
//! unit-of-work files.
//!
//! The folder holding a file is its state. A stage transition hard-links the
//! file under its new name, then removes the old name. Linking fails on a
//! taken name, so a move never replaces another file, and only one of several
//! movers racing on the same source gets to remove it. Files are never
//! copied: a failed move leaves the file exactly where it was. Links cannot
//! span filesystems, so a vault split across mounts reports
//! `QueueError::CrossDevice` instead of falling back to a copy.

pub mod claim;
pub mod stage;
pub mod unit;

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};

pub use claim::ClaimManager;
pub use stage::{GENERAL_BUCKET, Platform, Stage, dirs};
pub use unit::{Metadata, UnitFile, read_unit, unit_file_name, update_metadata, write_unit_atomic};

/// Handle on a vault root. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, stage: &Stage) -> PathBuf {
        self.root.join(stage.relative_dir())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(dirs::LOGS)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(dirs::STATE)
    }

    /// Create every fixed directory. Idempotent.
    pub async fn ensure_layout(&self) -> std::result::Result<(), QueueError> {
        let mut wanted: Vec<PathBuf> = [
            Stage::Inbox,
            Stage::NeedsAction,
            Stage::Approved,
            Stage::Rejected,
            Stage::Done,
            Stage::Failed,
            Stage::Quarantine,
            Stage::pending(None),
        ]
        .iter()
        .map(|s| self.stage_dir(s))
        .collect();
        wanted.extend(
            Platform::ALL
                .iter()
                .map(|p| self.stage_dir(&Stage::pending(Some(*p)))),
        );
        wanted.push(self.root.join(dirs::IN_PROGRESS));
        wanted.push(self.logs_dir());
        wanted.push(self.state_dir());

        for dir in wanted {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| QueueError::io(&dir, e))?;
        }
        debug!(root = %self.root.display(), "Vault layout ensured");
        Ok(())
    }

    /// Stage of a file from the directory containing it, or `None` when the
    /// path is not inside a stage directory of this vault.
    pub fn stage_of(&self, path: &Path) -> Option<Stage> {
        let parent = path.parent()?.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in parent.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        parts.join("/").parse().ok()
    }

    /// Resolve a user-supplied reference to a file in the vault: an existing
    /// path, a path relative to the vault root, or a bare file name searched
    /// across the stage directories.
    pub async fn locate(&self, reference: &Path) -> std::result::Result<PathBuf, QueueError> {
        let candidates = [reference.to_path_buf(), self.root.join(reference)];
        for candidate in candidates {
            if is_file(&candidate).await && self.stage_of(&candidate).is_some() {
                return Ok(candidate);
            }
        }

        if reference.components().count() == 1 {
            for dir in self.stage_dirs().await? {
                let candidate = dir.join(reference);
                if is_file(&candidate).await {
                    return Ok(candidate);
                }
            }
        }

        Err(QueueError::NotInVault(reference.to_path_buf()))
    }

    /// Move `file` into `stage`.
    ///
    /// Validates the transition when the file's current stage is known, creates
    /// the destination directory, and never overwrites: a taken name gets a
    /// `_<YYYYMMDD_HHMMSS>` suffix, then `_<n>`.
    pub async fn move_to_stage(
        &self,
        file: &Path,
        stage: &Stage,
    ) -> std::result::Result<PathBuf, QueueError> {
        let file_name = file
            .file_name()
            .ok_or_else(|| QueueError::NoFileName(file.to_path_buf()))?;
        self.relocate(file, stage, Path::new(file_name)).await
    }

    /// Like `move_to_stage`, but the file takes `new_name` at the destination.
    pub async fn move_to_stage_as(
        &self,
        file: &Path,
        stage: &Stage,
        new_name: &str,
    ) -> std::result::Result<PathBuf, QueueError> {
        let new_name = Path::new(new_name);
        if new_name.components().count() != 1 || new_name.file_name().is_none() {
            return Err(QueueError::NoFileName(new_name.to_path_buf()));
        }
        self.relocate(file, stage, new_name).await
    }

    async fn relocate(
        &self,
        file: &Path,
        stage: &Stage,
        file_name: &Path,
    ) -> std::result::Result<PathBuf, QueueError> {
        let from = self.stage_of(file);
        if let Some(from) = &from {
            if from == stage {
                return Ok(file.to_path_buf());
            }
            if !from.can_transition_to(stage) {
                return Err(QueueError::InvalidTransition {
                    from: from.to_string(),
                    to: stage.to_string(),
                });
            }
        }

        let dest_dir = self.stage_dir(stage);
        fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| QueueError::io(&dest_dir, e))?;

        let dest = link_into(file, &dest_dir, file_name).await?;

        info!(
            file = %file_name.display(),
            from = %from.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            to = %stage,
            "Moved unit"
        );
        Ok(dest)
    }

    /// Snapshot of the `*.md` unit files in a stage.
    pub async fn list(&self, stage: &Stage) -> std::result::Result<Vec<PathBuf>, QueueError> {
        list_files(&self.stage_dir(stage), true).await
    }

    /// Snapshot of every visible file in a stage, whatever its extension.
    pub async fn list_all(&self, stage: &Stage) -> std::result::Result<Vec<PathBuf>, QueueError> {
        list_files(&self.stage_dir(stage), false).await
    }

    /// Units awaiting approval across all platform buckets.
    pub async fn list_pending(&self) -> std::result::Result<Vec<PathBuf>, QueueError> {
        let mut files = Vec::new();
        for bucket in subdirs(&self.root.join(dirs::PENDING_APPROVAL)).await? {
            files.extend(self.list(&Stage::PendingApproval(bucket)).await?);
        }
        Ok(files)
    }

    /// Producer entry point: write a new unit into `stage` under a fresh name.
    pub async fn create_unit<I, K, V>(
        &self,
        stage: &Stage,
        kind: &str,
        fields: I,
        body: impl Into<String>,
    ) -> Result<PathBuf>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let unit = UnitFile::new(kind, fields, body);
        self.insert_unit(stage, kind, &unit).await
    }

    /// Write an already-built unit into `stage` under a fresh name.
    pub async fn insert_unit(&self, stage: &Stage, kind: &str, unit: &UnitFile) -> Result<PathBuf> {
        let dir = self.stage_dir(stage);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| QueueError::io(&dir, e))?;

        let path = unique_destination(&dir, Path::new(&unit_file_name(kind))).await;
        write_unit_atomic(&path, unit).await?;

        info!(file = %path.display(), stage = %stage, kind, "Created unit");
        Ok(path)
    }

    /// Counts per stage, pending approvals by platform, claims by agent.
    pub async fn status(&self) -> std::result::Result<VaultStatus, QueueError> {
        let mut stages = BTreeMap::new();
        for stage in [
            Stage::Inbox,
            Stage::NeedsAction,
            Stage::Approved,
            Stage::Rejected,
            Stage::Done,
            Stage::Failed,
            Stage::Quarantine,
        ] {
            let count = match stage {
                Stage::Inbox => self.list_all(&stage).await?.len(),
                _ => self.list(&stage).await?.len(),
            };
            stages.insert(stage.to_string(), count);
        }

        let mut pending_by_platform = BTreeMap::new();
        for bucket in subdirs(&self.root.join(dirs::PENDING_APPROVAL)).await? {
            let count = self.list(&Stage::PendingApproval(bucket.clone())).await?.len();
            pending_by_platform.insert(bucket, count);
        }

        let mut in_progress_by_agent = BTreeMap::new();
        for agent in subdirs(&self.root.join(dirs::IN_PROGRESS)).await? {
            let count = self.list(&Stage::InProgress(agent.clone())).await?.len();
            in_progress_by_agent.insert(agent, count);
        }

        Ok(VaultStatus {
            root: self.root.clone(),
            generated_at: Utc::now(),
            pending_total: pending_by_platform.values().sum(),
            in_progress_total: in_progress_by_agent.values().sum(),
            stages,
            pending_by_platform,
            in_progress_by_agent,
        })
    }

    async fn stage_dirs(&self) -> std::result::Result<Vec<PathBuf>, QueueError> {
        let mut found = Vec::new();
        for name in subdirs(&self.root).await? {
            if name == dirs::LOGS || name == dirs::STATE {
                continue;
            }
            let dir = self.root.join(&name);
            if name == dirs::PENDING_APPROVAL || name == dirs::IN_PROGRESS {
                for child in subdirs(&dir).await? {
                    found.push(dir.join(child));
                }
            } else {
                found.push(dir);
            }
        }
        Ok(found)
    }
}

/// Platform a unit targets: the `platform` field, then `type`, then tags in
/// the file name.
pub fn platform_of(unit: &UnitFile, path: &Path) -> Option<Platform> {
    [unit::keys::PLATFORM, unit::keys::TYPE]
        .iter()
        .filter_map(|key| unit.get_nonempty(key))
        .find_map(|value| value.parse().ok())
        .or_else(|| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(Platform::detect_from_filename)
        })
}

/// Snapshot of the vault for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub root: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub stages: BTreeMap<String, usize>,
    pub pending_by_platform: BTreeMap<String, usize>,
    pub pending_total: usize,
    pub in_progress_by_agent: BTreeMap<String, usize>,
    pub in_progress_total: usize,
}

/// Move `from` into `dir` under the first free candidate name.
///
/// Never replaces an existing file. When two movers race on the same source,
/// the one whose `remove_file` finds it gone drops its own link and gets
/// `SourceMissing`.
async fn link_into(from: &Path, dir: &Path, file_name: &Path) -> std::result::Result<PathBuf, QueueError> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let mut n = 0;
    let dest = loop {
        let candidate = candidate_name(dir, file_name, &stamp, n);
        match fs::hard_link(from, &candidate).await {
            Ok(()) => break candidate,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(classify_move_error(from, &candidate, e).await),
        }
    };

    // Another mover may have unlinked the source and a new file taken its name.
    let removed = if same_file(from, &dest).await {
        fs::remove_file(from).await
    } else {
        Err(io::Error::from(io::ErrorKind::NotFound))
    };
    match removed {
        Ok(()) => Ok(dest),
        Err(e) => {
            if let Err(undo) = fs::remove_file(&dest).await {
                warn!(file = %dest.display(), error = %undo, "Could not remove link after failed move");
            }
            if e.kind() == io::ErrorKind::NotFound {
                Err(QueueError::SourceMissing(from.to_path_buf()))
            } else {
                Err(QueueError::io(from, e))
            }
        }
    }
}

#[cfg(unix)]
async fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::symlink_metadata(a).await, fs::symlink_metadata(b).await) {
        (Ok(x), Ok(y)) => x.dev() == y.dev() && x.ino() == y.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
async fn same_file(a: &Path, _b: &Path) -> bool {
    exists(a).await
}

async fn classify_move_error(from: &Path, to: &Path, e: io::Error) -> QueueError {
    match e.kind() {
        io::ErrorKind::CrossesDevices => QueueError::CrossDevice {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        },
        io::ErrorKind::NotFound if !exists(from).await => QueueError::SourceMissing(from.to_path_buf()),
        _ => QueueError::io(from, e),
    }
}

/// Candidate `n` for `file_name` in `dir`: the name itself, then
/// `<stem>_<stamp>`, then `<stem>_<stamp>_<n-1>`.
fn candidate_name(dir: &Path, file_name: &Path, stamp: &str, n: u32) -> PathBuf {
    if n == 0 {
        return dir.join(file_name);
    }
    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    match n {
        1 => dir.join(format!("{stem}_{stamp}{ext}")),
        _ => dir.join(format!("{stem}_{stamp}_{}{ext}", n - 1)),
    }
}

/// First free name in `dir` for `file_name`.
async fn unique_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let mut n = 0;
    loop {
        let candidate = candidate_name(dir, file_name, &stamp, n);
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

async fn list_files(dir: &Path, md_only: bool) -> std::result::Result<Vec<PathBuf>, QueueError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::io(dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| QueueError::io(dir, e))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.ends_with(".tmp") {
            continue;
        }
        if md_only && !name.ends_with(".md") {
            continue;
        }
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

async fn subdirs(dir: &Path) -> std::result::Result<Vec<String>, QueueError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::io(dir, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| QueueError::io(dir, e))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_dir && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn vault() -> (TempDir, Vault) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout().await.unwrap();
        (dir, vault)
    }

    #[tokio::test]
    async fn ensure_layout_is_idempotent() {
        let (_dir, vault) = vault().await;
        vault.ensure_layout().await.unwrap();
        assert!(vault.stage_dir(&Stage::NeedsAction).is_dir());
        assert!(vault.stage_dir(&Stage::pending(Some(Platform::WhatsApp))).is_dir());
        assert!(vault.logs_dir().is_dir());
    }

    #[tokio::test]
    async fn stage_of_maps_directories() {
        let (_dir, vault) = vault().await;
        let root = vault.root().to_path_buf();

        assert_eq!(
            vault.stage_of(&root.join("Needs_Action/a.md")),
            Some(Stage::NeedsAction)
        );
        assert_eq!(
            vault.stage_of(&root.join("Pending_Approval/Email/a.md")),
            Some(Stage::PendingApproval("Email".into()))
        );
        assert_eq!(
            vault.stage_of(&root.join("In_Progress/bot/a.md")),
            Some(Stage::InProgress("bot".into()))
        );
        assert_eq!(vault.stage_of(&root.join("Logs/x.json")), None);
        assert_eq!(vault.stage_of(&root.join("top.md")), None);
        assert_eq!(vault.stage_of(Path::new("/elsewhere/Done/a.md")), None);
    }

    #[tokio::test]
    async fn move_creates_missing_stage_dir() {
        let (_dir, vault) = vault().await;
        let path = vault
            .create_unit(&Stage::NeedsAction, "task", [("priority", "high")], "Do it\n")
            .await
            .unwrap();

        let moved = vault
            .move_to_stage(&path, &Stage::Other("Archive/2026".into()))
            .await
            .unwrap();
        assert!(moved.starts_with(vault.root().join("Archive/2026")));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn move_rejects_invalid_transition() {
        let (_dir, vault) = vault().await;
        let path = vault
            .create_unit(&Stage::Done, "task", Vec::<(String, String)>::new(), "")
            .await
            .unwrap();

        let err = vault.move_to_stage(&path, &Stage::Approved).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn move_of_vanished_file_reports_source_missing() {
        let (_dir, vault) = vault().await;
        let ghost = vault.stage_dir(&Stage::NeedsAction).join("ghost.md");
        let err = vault.move_to_stage(&ghost, &Stage::Done).await.unwrap_err();
        assert!(matches!(err, QueueError::SourceMissing(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_name_moves_keep_every_file() {
        let (_dir, vault) = vault().await;
        let done = vault.stage_dir(&Stage::Done);

        for round in 0..20 {
            let name = format!("x{round}.md");
            let a = vault.stage_dir(&Stage::Approved).join(&name);
            let b = vault.stage_dir(&Stage::NeedsAction).join(&name);
            fs::write(&a, "from a\n").await.unwrap();
            fs::write(&b, "from b\n").await.unwrap();

            let (va, vb) = (vault.clone(), vault.clone());
            let (ra, rb) = tokio::join!(
                tokio::spawn(async move { va.move_to_stage(&a, &Stage::Done).await }),
                tokio::spawn(async move { vb.move_to_stage(&b, &Stage::Done).await }),
            );
            let (pa, pb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());

            assert_ne!(pa, pb);
            assert_eq!(fs::read_to_string(&pa).await.unwrap(), "from a\n");
            assert_eq!(fs::read_to_string(&pb).await.unwrap(), "from b\n");
        }
        assert_eq!(vault.list(&Stage::Done).await.unwrap().len(), 40);
        assert!(done.join("x0.md").exists());
    }

    #[tokio::test]
    async fn losing_mover_leaves_no_stray_link() {
        let (_dir, vault) = vault().await;
        let src = vault.stage_dir(&Stage::NeedsAction).join("once.md");
        fs::write(&src, "body\n").await.unwrap();

        let stage_a = Stage::InProgress("a".into());
        let stage_b = Stage::InProgress("b".into());
        let (a, b) = tokio::join!(
            vault.move_to_stage(&src, &stage_a),
            vault.move_to_stage(&src, &stage_b),
        );
        assert!(a.is_ok() ^ b.is_ok());
        let copies = vault.list(&Stage::InProgress("a".into())).await.unwrap().len()
            + vault.list(&Stage::InProgress("b".into())).await.unwrap().len();
        assert_eq!(copies, 1);
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn list_skips_hidden_temp_and_non_markdown() {
        let (_dir, vault) = vault().await;
        let dir = vault.stage_dir(&Stage::NeedsAction);
        fs::write(dir.join("a.md"), "a").await.unwrap();
        fs::write(dir.join(".a.md.1234.tmp"), "partial").await.unwrap();
        fs::write(dir.join("notes.txt"), "txt").await.unwrap();

        let listed = vault.list(&Stage::NeedsAction).await.unwrap();
        assert_eq!(listed, vec![dir.join("a.md")]);
        assert_eq!(vault.list_all(&Stage::NeedsAction).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn locate_finds_bare_names() {
        let (_dir, vault) = vault().await;
        let path = vault
            .create_unit(&Stage::pending(Some(Platform::Twitter)), "tweet", [("platform", "twitter")], "hi")
            .await
            .unwrap();
        let name = PathBuf::from(path.file_name().unwrap());

        assert_eq!(vault.locate(&name).await.unwrap(), path);
        assert!(matches!(
            vault.locate(Path::new("nope.md")).await,
            Err(QueueError::NotInVault(_))
        ));
    }

    #[test]
    fn platform_resolution_order() {
        let unit = UnitFile::parse("---\nplatform: x\ntype: email\n---\n");
        assert_eq!(platform_of(&unit, Path::new("WA_1.md")), Some(Platform::Twitter));

        let unit = UnitFile::parse("---\ntype: linkedin_post\n---\n");
        assert_eq!(platform_of(&unit, Path::new("a.md")), Some(Platform::LinkedIn));

        let unit = UnitFile::parse("---\nplatform: carrier-pigeon\ntype: note\n---\n");
        assert_eq!(platform_of(&unit, Path::new("TWEET_1.md")), Some(Platform::Twitter));
        assert_eq!(platform_of(&unit, Path::new("note.md")), None);
    }

    #[tokio::test]
    async fn status_counts_per_stage_and_platform() {
        let (_dir, vault) = vault().await;
        let none = Vec::<(String, String)>::new;
        vault.create_unit(&Stage::NeedsAction, "a", none(), "").await.unwrap();
        vault.create_unit(&Stage::NeedsAction, "b", none(), "").await.unwrap();
        vault
            .create_unit(&Stage::pending(Some(Platform::Email)), "c", none(), "")
            .await
            .unwrap();
        vault
            .create_unit(&Stage::InProgress("bot".into()), "d", none(), "")
            .await
            .unwrap();

        let status = vault.status().await.unwrap();
        assert_eq!(status.stages["Needs_Action"], 2);
        assert_eq!(status.pending_by_platform["Email"], 1);
        assert_eq!(status.pending_by_platform["Twitter"], 0);
        assert_eq!(status.pending_total, 1);
        assert_eq!(status.in_progress_by_agent["bot"], 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stages"]["Done"], 0);
    }
}

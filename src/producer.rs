//! Producers: turn raw drops in `Inbox/` into units in `Needs_Action`.
//!
//! - `.eml` files are parsed with mail-parser into `type: email` units.
//! - `.md` files are moved into `Needs_Action` under a fresh name.
//! - Anything else becomes a `type: file_drop` unit.
//!
//! An inbox file is claimed into `In_Progress/<agent>-inbox` before it is
//! read, so each file is converted at most once even with several producers.
//! Converted raw sources are moved to `Done`, failed ones to `Failed`; none
//! are deleted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mail_parser::MessageParser;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::error::{QueueError, Result, UnitError};
use crate::vault::claim::role_agent;
use crate::vault::unit::keys;
use crate::vault::{ClaimManager, Stage, Vault, read_unit, unit_file_name};

/// Quiet period after the last change notification before a pass runs.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Longest body kept from a dropped text file.
const MAX_DROP_CHARS: usize = 20_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub ingested: usize,
    pub failed: usize,
    /// Left claimed by an earlier pass and finished now.
    pub recovered: usize,
}

#[derive(Clone)]
pub struct InboxIngest {
    vault: Vault,
    claims: ClaimManager,
    audit: AuditLog,
    agent: String,
}

impl InboxIngest {
    pub fn new(vault: Vault, agent: &str) -> Self {
        Self {
            claims: ClaimManager::new(vault.clone()),
            audit: AuditLog::new(&vault),
            agent: role_agent(agent, "inbox"),
            vault,
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Turn one inbox file into a unit in `Needs_Action`. Returns `None` when
    /// the file vanished or another producer claimed it first.
    pub async fn ingest(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(claimed) = self.claims.claim(path, &self.agent).await? else {
            debug!(file = %path.display(), "Inbox file already taken");
            return Ok(None);
        };
        self.convert_claimed(&claimed, &file_name(path)).await.map(Some)
    }

    /// One pass over everything currently in `Inbox/`.
    pub async fn ingest_once(&self) -> std::result::Result<IngestStats, QueueError> {
        let mut stats = IngestStats {
            recovered: self.recover().await?,
            ..IngestStats::default()
        };
        for file in self.vault.list_all(&Stage::Inbox).await? {
            match self.ingest(&file).await {
                Ok(Some(_)) => stats.ingested += 1,
                Ok(None) => {}
                Err(e) => {
                    stats.failed += 1;
                    error!(file = %file.display(), error = %e, "Failed to ingest inbox file");
                }
            }
        }
        if stats != IngestStats::default() {
            info!(
                ingested = stats.ingested,
                failed = stats.failed,
                recovered = stats.recovered,
                "Inbox pass complete"
            );
        }
        Ok(stats)
    }

    /// Sources an interrupted pass left claimed. A markdown file is only ever
    /// moved whole, so it is converted again; for anything else the unit may
    /// already exist and the source goes to `Failed`.
    async fn recover(&self) -> std::result::Result<usize, QueueError> {
        let leftovers = self
            .vault
            .list_all(&Stage::InProgress(self.agent.clone()))
            .await?;
        for path in &leftovers {
            warn!(file = %path.display(), "Inbox file left in progress by an earlier pass");
            if is_markdown(path) {
                if let Err(e) = self.convert_claimed(path, &file_name(path)).await {
                    error!(file = %path.display(), error = %e, "Could not recover inbox file");
                }
            } else {
                self.reject(path, "Interrupted during ingest; a unit may already exist for this file")
                    .await;
            }
        }
        Ok(leftovers.len())
    }

    /// Convert a claimed source. On failure the source goes to `Failed`.
    async fn convert_claimed(&self, claimed: &Path, source: &str) -> Result<PathBuf> {
        let converted = if is_markdown(claimed) {
            self.ingest_markdown(claimed).await
        } else if has_extension(claimed, "eml") {
            self.ingest_email(claimed, source).await
        } else {
            self.ingest_drop(claimed, source).await
        };

        let unit = match converted {
            Ok(unit) => unit,
            Err(e) => {
                self.reject(claimed, &e.to_string()).await;
                return Err(e);
            }
        };

        self.audit
            .record_or_warn(
                AuditEntry::new(AuditAction::UnitCreated, &self.agent)
                    .file(&unit)
                    .details(json!({ "source": source })),
            )
            .await;
        Ok(unit)
    }

    async fn ingest_markdown(&self, claimed: &Path) -> Result<PathBuf> {
        let unit = read_unit(claimed).await?;
        let kind = unit.get_nonempty(keys::TYPE).unwrap_or("task").to_string();
        let dest = self
            .vault
            .move_to_stage_as(claimed, &Stage::NeedsAction, &unit_file_name(&kind))
            .await?;
        Ok(dest)
    }

    async fn ingest_email(&self, claimed: &Path, source: &str) -> Result<PathBuf> {
        let bytes = tokio::fs::read(claimed)
            .await
            .map_err(|e| UnitError::io(claimed, e))?;
        let Some(parsed) = MessageParser::default().parse(&bytes[..]) else {
            warn!(file = %source, "Unparseable email, ingesting as a file drop");
            return self.ingest_drop(claimed, source).await;
        };

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .unwrap_or("unknown")
            .to_string();
        let subject = parsed.subject().unwrap_or("(no subject)").to_string();
        let text = if let Some(text) = parsed.body_text(0) {
            text.to_string()
        } else if let Some(html) = parsed.body_html(0) {
            strip_html(html.as_ref())
        } else {
            "(no readable content)".to_string()
        };

        let mut fields = vec![
            ("from", sender.clone()),
            ("subject", subject.clone()),
            (keys::PLATFORM, "email".to_string()),
            ("source_file", source.to_string()),
        ];
        if let Some(id) = parsed.message_id() {
            fields.push(("message_id", id.to_string()));
        }
        if let Some(date) = parsed.date() {
            fields.push(("received_at", date.to_rfc3339()));
        }

        let body = format!("\n# Email: {subject}\n\n**From:** {sender}\n\n## Content\n\n{}\n", text.trim());
        let unit = self
            .vault
            .create_unit(&Stage::NeedsAction, "email", fields, body)
            .await?;
        self.archive_source(claimed).await;
        info!(from = %sender, subject = %subject, unit = %unit.display(), "Email ingested");
        Ok(unit)
    }

    async fn ingest_drop(&self, claimed: &Path, source: &str) -> Result<PathBuf> {
        let bytes = tokio::fs::read(claimed)
            .await
            .map_err(|e| UnitError::io(claimed, e))?;

        let content = match std::str::from_utf8(&bytes) {
            Ok(text) if !text.contains('\0') => {
                let mut text: String = text.chars().take(MAX_DROP_CHARS).collect();
                if text.len() < bytes.len() && text.chars().count() == MAX_DROP_CHARS {
                    text.push_str("\n\n(truncated)");
                }
                text
            }
            _ => format!("Binary file, {} bytes. The original is kept in Done.", bytes.len()),
        };

        let body = format!("\n# File Drop: {source}\n\n## Content\n\n{}\n", content.trim_end());
        let unit = self
            .vault
            .create_unit(
                &Stage::NeedsAction,
                "file_drop",
                [
                    ("original_name", source.to_string()),
                    ("size_bytes", bytes.len().to_string()),
                    ("source_file", source.to_string()),
                ],
                body,
            )
            .await?;
        self.archive_source(claimed).await;
        info!(file = %source, unit = %unit.display(), "File drop ingested");
        Ok(unit)
    }

    /// Move a converted source to `Done`. On failure it stays claimed and the
    /// next pass moves it to `Failed`; it is never converted twice.
    async fn archive_source(&self, claimed: &Path) {
        if let Err(e) = self.claims.release(claimed, &Stage::Done).await {
            error!(file = %claimed.display(), error = %e, "Could not archive inbox source");
        }
    }

    /// Best effort: move a source that could not be converted to `Failed`.
    async fn reject(&self, claimed: &Path, message: &str) {
        let dest = match self.claims.release(claimed, &Stage::Failed).await {
            Ok(dest) => dest,
            Err(e) => {
                error!(file = %claimed.display(), error = %e, "Could not move inbox file to Failed");
                claimed.to_path_buf()
            }
        };
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

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
}

fn is_markdown(path: &Path) -> bool {
    has_extension(path, "md")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Drop tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Watch `Inbox/` and ingest new files.
///
/// Change notifications trigger a pass after a short quiet period; a full
/// rescan also runs every `rescan_interval` in case a notification is missed.
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop.
pub fn spawn_inbox_watcher(
    ingest: InboxIngest,
    rescan_interval: Duration,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>)> {
    let inbox = ingest.vault().stage_dir(&Stage::Inbox);
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);

    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| {
            if let Ok(event) = result {
                let _ = event_tx.blocking_send(event);
            }
        },
        Config::default(),
    )?;
    watcher.watch(&inbox, RecursiveMode::NonRecursive)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let _watcher = watcher;
        info!(
            inbox = %inbox.display(),
            rescan_secs = rescan_interval.as_secs(),
            "Inbox watcher started"
        );

        let mut rescan = tokio::time::interval(rescan_interval);
        let mut pending_since: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    if is_arrival(&event) {
                        debug!(paths = ?event.paths, "Inbox change detected");
                        pending_since = Some(tokio::time::Instant::now());
                    }
                }
                _ = rescan.tick() => {
                    pending_since = None;
                    run_pass(&ingest).await;
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if pending_since.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                        pending_since = None;
                        run_pass(&ingest).await;
                    }
                }
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Inbox watcher shutting down");
                return;
            }
        }
    });

    Ok((handle, shutdown_flag))
}

async fn run_pass(ingest: &InboxIngest) {
    if let Err(e) = ingest.ingest_once().await {
        error!(error = %e, "Inbox pass failed");
    }
}

fn is_arrival(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && !n.ends_with(".tmp"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, InboxIngest) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout().await.unwrap();
        (dir, InboxIngest::new(vault, "local"))
    }

    async fn drop_file(ingest: &InboxIngest, name: &str, content: &[u8]) -> PathBuf {
        let path = ingest.vault().stage_dir(&Stage::Inbox).join(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn eml_becomes_email_unit() {
        let (_dir, ingest) = setup().await;
        let raw = b"From: Alice <alice@example.com>\r\nTo: me@example.com\r\nSubject: Lunch?\r\nMessage-ID: <abc@example.com>\r\n\r\nAre you free on Friday?\r\n";
        let src = drop_file(&ingest, "msg.eml", raw).await;

        let unit_path = ingest.ingest(&src).await.unwrap().unwrap();
        let unit = read_unit(&unit_path).await.unwrap();
        assert_eq!(unit.get(keys::TYPE), Some("email"));
        assert_eq!(unit.get("from"), Some("alice@example.com"));
        assert_eq!(unit.get("subject"), Some("Lunch?"));
        assert_eq!(unit.get("message_id"), Some("abc@example.com"));
        assert!(unit.body().contains("Are you free on Friday?"));

        assert!(!src.exists());
        let done = ingest.vault().list_all(&Stage::Done).await.unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].to_string_lossy().ends_with("msg.eml"));
    }

    #[tokio::test]
    async fn markdown_moved_under_fresh_name() {
        let (_dir, ingest) = setup().await;
        let content = "---\ntype: linkedin_post\n---\n## Post Content\n\nHiring!\n";
        let src = drop_file(&ingest, "post.md", content.as_bytes()).await;

        let unit_path = ingest.ingest(&src).await.unwrap().unwrap();
        let name = unit_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("LINKEDIN_POST_"));
        assert_eq!(tokio::fs::read_to_string(&unit_path).await.unwrap(), content);
        assert!(ingest.vault().list_all(&Stage::Done).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn text_drop_wrapped() {
        let (_dir, ingest) = setup().await;
        let src = drop_file(&ingest, "notes.txt", b"call the accountant").await;

        let unit_path = ingest.ingest(&src).await.unwrap().unwrap();
        let unit = read_unit(&unit_path).await.unwrap();
        assert_eq!(unit.get(keys::TYPE), Some("file_drop"));
        assert_eq!(unit.get("original_name"), Some("notes.txt"));
        assert!(unit.body().contains("call the accountant"));
        assert_eq!(ingest.vault().list_all(&Stage::Done).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingest_once_skips_dotfiles() {
        let (_dir, ingest) = setup().await;
        drop_file(&ingest, ".partial", b"x").await;
        drop_file(&ingest, "a.txt", b"a").await;
        drop_file(&ingest, "b.md", b"b").await;

        let stats = ingest.ingest_once().await.unwrap();
        assert_eq!(stats.ingested, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(ingest.vault().list(&Stage::NeedsAction).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn vanished_file_is_not_an_error() {
        let (_dir, ingest) = setup().await;
        let missing = ingest.vault().stage_dir(&Stage::Inbox).join("gone.txt");
        assert_eq!(ingest.ingest(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unarchivable_source_is_converted_once() {
        let (dir, ingest) = setup().await;
        let done = dir.path().join("Done");
        tokio::fs::remove_dir(&done).await.unwrap();
        tokio::fs::write(&done, "not a directory").await.unwrap();
        drop_file(&ingest, "note.txt", b"remember the milk").await;

        let first = ingest.ingest_once().await.unwrap();
        let second = ingest.ingest_once().await.unwrap();
        assert_eq!(first.ingested, 1);
        assert_eq!(second.ingested, 0);
        assert_eq!(second.recovered, 1);

        let vault = ingest.vault();
        assert_eq!(vault.list(&Stage::NeedsAction).await.unwrap().len(), 1);
        assert!(vault.list_all(&Stage::Inbox).await.unwrap().is_empty());
        assert_eq!(vault.list_all(&Stage::Failed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_producers_convert_each_file_once() {
        let (dir, first) = setup().await;
        let second = InboxIngest::new(Vault::new(dir.path()), "other");
        for i in 0..5 {
            drop_file(&first, &format!("drop{i}.txt"), b"payload").await;
        }

        let (a, b) = tokio::join!(first.ingest_once(), second.ingest_once());
        assert_eq!(a.unwrap().ingested + b.unwrap().ingested, 5);
        assert_eq!(first.vault().list(&Stage::NeedsAction).await.unwrap().len(), 5);
        assert_eq!(first.vault().list_all(&Stage::Done).await.unwrap().len(), 5);
    }

    #[test]
    fn strip_html_collapses_tags() {
        assert_eq!(strip_html("<p>Hello</p><p>World</p>"), "Hello World");
        assert_eq!(strip_html("<b>Bold</b> text"), "Bold text");
    }
}

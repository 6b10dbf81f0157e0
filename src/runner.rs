//! Background loops for the classifier and posting worker.
//!
//! Each loop runs one pass per tick and stops when its shutdown flag is set.
//! A pass in flight always finishes, so no claimed unit is abandoned in
//! `In_Progress`. Errors from a pass are logged; the loop keeps going.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{error, info};

use crate::pipeline::Classifier;
use crate::posting::PostingWorker;

/// How often an idle loop checks its shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Wait for the next tick. Returns false once shutdown is requested.
async fn next_tick(tick: &mut Interval, shutdown: &AtomicBool) -> bool {
    loop {
        tokio::select! {
            _ = tick.tick() => return !shutdown.load(Ordering::Relaxed),
            _ = tokio::time::sleep(SHUTDOWN_POLL) => {
                if shutdown.load(Ordering::Relaxed) {
                    return false;
                }
            }
        }
    }
}

/// Spawn a task running `Classifier::run_once` every `interval`.
pub fn spawn_classifier_loop(
    classifier: Classifier,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            agent = classifier.agent(),
            interval_secs = interval.as_secs(),
            "Classifier loop started"
        );
        let mut tick = tokio::time::interval(interval);

        loop {
            if !next_tick(&mut tick, &shutdown).await {
                info!("Classifier loop shutting down");
                return;
            }

            if let Err(e) = classifier.run_once().await {
                error!(error = %e, "Classifier pass failed");
            }
        }
    });

    (handle, shutdown_flag)
}

/// Spawn a task running `PostingWorker::run_once` every `interval`.
pub fn spawn_posting_loop(
    worker: PostingWorker,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Posting loop started");
        let mut tick = tokio::time::interval(interval);

        loop {
            if !next_tick(&mut tick, &shutdown).await {
                info!("Posting loop shutting down");
                return;
            }

            if let Err(e) = worker.run_once().await {
                error!(error = %e, "Posting pass failed");
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::vault::{Stage, Vault};
    use tempfile::TempDir;

    #[tokio::test]
    async fn classifier_loop_processes_and_stops() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout().await.unwrap();
        vault
            .create_unit(&Stage::NeedsAction, "task", [("platform", "twitter")], "Post an update\n")
            .await
            .unwrap();

        let config = VaultConfig {
            vault_path: dir.path().to_path_buf(),
            ..VaultConfig::default()
        };
        let (handle, shutdown) =
            spawn_classifier_loop(Classifier::new(&config), Duration::from_millis(20));

        for _ in 0..50 {
            if vault.list(&Stage::NeedsAction).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();

        assert!(vault.list(&Stage::NeedsAction).await.unwrap().is_empty());
        assert_eq!(vault.list_pending().await.unwrap().len(), 1);
    }
}

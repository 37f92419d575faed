//! Download scheduler: drains the checkpoint store's pending set with a
//! fixed pool of workers. Each drain snapshots the pending set into an
//! [`queue::AssetQueue`], so assets discovered mid-drain wait for the next
//! one.

pub mod error;
pub mod file;
pub mod paths;
pub mod queue;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::gateway::SessionClient;
use crate::icloud::photos::{AssetVersion, PhotoAsset};
use crate::retry::RetryConfig;
use crate::state::CheckpointStore;
use crate::types::{FileStructure, VersionSize};

pub use self::error::DownloadError;
use self::queue::{AssetQueue, QueuePolicy, ThreadRngDraw};

/// Subset of application config consumed by the download scheduler.
/// Decoupled from CLI parsing so the scheduler can be tested independently.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub(crate) directory: PathBuf,
    pub(crate) folder_structure: String,
    pub(crate) file_structure: FileStructure,
    pub(crate) size: VersionSize,
    pub(crate) with_live_photo: bool,
    pub(crate) threads: usize,
    /// Stop once this many assets were transferred by this process.
    pub(crate) stop_after: Option<u64>,
    pub(crate) max_failures: u64,
    pub(crate) retry: RetryConfig,
    pub(crate) queue: QueuePolicy,
}

impl DownloadConfig {
    /// Every local path this configuration may have written for `asset`:
    /// the configured size, its original fallback and live companions.
    pub(crate) fn candidate_paths(&self, asset: &PhotoAsset) -> Vec<PathBuf> {
        let dir = asset.output_dir(&self.directory, &self.folder_structure);
        let mut paths = Vec::new();
        for live in [false, true] {
            if live && !self.with_live_photo {
                continue;
            }
            for size in [self.size, VersionSize::Original] {
                let path = asset.local_path(&dir, size, self.file_structure, live);
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }
}

/// Counters for one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub downloaded: u64,
    pub skipped: u64,
    pub purged: u64,
    pub failed: u64,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// At least one file came over the network.
    Transferred,
    /// Everything was already on disk.
    Present,
}

pub struct DownloadScheduler {
    client: SessionClient,
    store: Arc<dyn CheckpointStore>,
    config: Arc<DownloadConfig>,
    /// Failures over the process lifetime, shared by all workers.
    failures: AtomicU64,
    /// Assets transferred over the process lifetime.
    transferred: AtomicU64,
}

impl std::fmt::Debug for DownloadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadScheduler")
            .field("config", &self.config)
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .field("transferred", &self.transferred.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DownloadScheduler {
    pub fn new(
        client: SessionClient,
        store: Arc<dyn CheckpointStore>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            client,
            store,
            config: Arc::new(config),
            failures: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Whether the `stop_after` quota has been met.
    pub fn stop_reached(&self) -> bool {
        self.config
            .stop_after
            .is_some_and(|limit| self.transferred() >= limit)
    }

    fn check_budget(&self) -> Result<(), DownloadError> {
        let failures = self.failures();
        if failures > self.config.max_failures {
            return Err(DownloadError::BudgetExhausted {
                failures,
                budget: self.config.max_failures,
            });
        }
        Ok(())
    }

    /// Download everything currently pending.
    ///
    /// Returns `BudgetExhausted` once cumulative failures pass the budget;
    /// other per-asset errors are counted and logged.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<DrainReport, DownloadError> {
        self.check_budget()?;
        let pending = self.store.list_pending().await?;
        if pending.is_empty() {
            tracing::debug!("Nothing pending");
            return Ok(DrainReport::default());
        }

        let started = Instant::now();
        let total = pending.len();
        let queue = Mutex::new(AssetQueue::new(
            pending,
            self.config.queue.clone(),
            Box::new(ThreadRngDraw),
            Local::now(),
        ));
        let report = Mutex::new(DrainReport::default());
        let workers = self.config.threads.max(1);
        tracing::info!(pending = total, workers, "Starting download drain");

        let results = futures_util::future::join_all(
            (0..workers).map(|worker| self.run_worker(worker, &queue, &report, cancel)),
        )
        .await;
        for result in results {
            result?;
        }

        let report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            purged = report.purged,
            failed = report.failed,
            elapsed = %format_duration(started.elapsed()),
            "Drain finished"
        );
        self.check_budget()?;
        Ok(report)
    }

    async fn run_worker(
        &self,
        worker: usize,
        queue: &Mutex<AssetQueue>,
        report: &Mutex<DrainReport>,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        loop {
            if cancel.is_cancelled() {
                tracing::debug!(worker, "Shutdown requested, worker exiting");
                return Ok(());
            }
            self.check_budget()?;
            if self.stop_reached() {
                tracing::debug!(worker, "Download quota reached, worker exiting");
                return Ok(());
            }
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pick();
            let Some(asset) = next else {
                return Ok(());
            };

            let result = self.download_asset(&asset).await;
            let counts = |f: fn(&mut DrainReport)| {
                f(&mut report.lock().unwrap_or_else(PoisonError::into_inner));
            };
            match result {
                Ok(outcome) => {
                    if let Err(e) = self.store.mark_done(asset.id()).await {
                        self.failures.fetch_add(1, Ordering::SeqCst);
                        counts(|r| r.failed += 1);
                        tracing::error!(id = asset.id(), error = %e, "Could not mark asset done");
                        continue;
                    }
                    match outcome {
                        Outcome::Transferred => {
                            self.transferred.fetch_add(1, Ordering::SeqCst);
                            counts(|r| r.downloaded += 1);
                        }
                        Outcome::Present => counts(|r| r.skipped += 1),
                    }
                }
                Err(e) if e.is_resource_gone() => {
                    tracing::warn!(id = asset.id(), "Asset gone remotely, dropping record");
                    if let Err(e) = self.store.delete(asset.id()).await {
                        tracing::error!(id = asset.id(), error = %e, "Could not drop record");
                    }
                    counts(|r| r.purged += 1);
                }
                Err(e) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    counts(|r| r.failed += 1);
                    tracing::error!(
                        id = asset.id(),
                        failures,
                        budget = self.config.max_failures,
                        error = %e,
                        "Download failed"
                    );
                }
            }
        }
    }

    /// Materialize one asset, plus its live companion when enabled.
    async fn download_asset(&self, asset: &PhotoAsset) -> Result<Outcome, DownloadError> {
        let config = &self.config;
        let dir = asset.output_dir(&config.directory, &config.folder_structure);
        let modified = asset.asset_date();

        let (size, version) =
            pick_version(asset, config.size, false).ok_or_else(|| DownloadError::VersionMissing {
                id: asset.id().to_string(),
                size: config.size.as_str(),
            })?;
        let path = asset.local_path(&dir, size, config.file_structure, false);
        let mut outcome = Outcome::Present;
        if self.fetch(version, &path, modified).await? {
            outcome = Outcome::Transferred;
        }

        if config.with_live_photo && asset.is_live_photo() {
            match pick_version(asset, config.size, true) {
                Some((size, live)) => {
                    let path = asset.local_path(&dir, size, config.file_structure, true);
                    if self.fetch(live, &path, modified).await? {
                        outcome = Outcome::Transferred;
                    }
                }
                None => tracing::warn!(id = asset.id(), "Live photo without a video version"),
            }
        }
        Ok(outcome)
    }

    /// Returns `false` when the file is already present with the exact size.
    async fn fetch(
        &self,
        version: &AssetVersion,
        path: &Path,
        modified: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, DownloadError> {
        if is_present(path, version.size).await {
            tracing::debug!(path = %path.display(), "Already on disk");
            return Ok(false);
        }
        tracing::debug!(size_bytes = version.size, path = %path.display(), "Downloading");
        file::download_file(&self.client, version, path, modified, &self.config.retry).await?;
        tracing::info!(path = %path.display(), "Downloaded");
        Ok(true)
    }
}

/// The requested rendition, or the original when that one is missing.
fn pick_version(
    asset: &PhotoAsset,
    size: VersionSize,
    live_photo: bool,
) -> Option<(VersionSize, &AssetVersion)> {
    asset
        .version(size, live_photo)
        .map(|v| (size, v))
        .or_else(|| {
            asset
                .version(VersionSize::Original, live_photo)
                .map(|v| (VersionSize::Original, v))
        })
}

async fn is_present(path: &Path, expected_size: u64) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file() && m.len() == expected_size)
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::queue::QueuePolicy;
    use super::DownloadConfig;
    use crate::gateway::testing::{FakeGateway, ScriptedResponse};
    use crate::retry::RetryConfig;
    use crate::types::{FileStructure, VersionSize};

    /// Cross-platform temp directory for tests
    pub fn test_tmp_dir(subdir: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("claude")
            .join("scheduler_tests")
            .join(subdir);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn test_config(dir: &Path) -> DownloadConfig {
        DownloadConfig {
            directory: dir.to_path_buf(),
            folder_structure: "none".into(),
            file_structure: FileStructure::Name,
            size: VersionSize::Original,
            with_live_photo: true,
            threads: 2,
            stop_after: None,
            max_failures: 20,
            retry: RetryConfig {
                max_retries: 0,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            queue: QueuePolicy::default(),
        }
    }

    /// Serve `https://cdn.test/mNNN` with `100 + NNN` bytes.
    pub fn serve_cdn(fake: &FakeGateway) {
        fake.route(|req| {
            let i: usize = req.url.strip_prefix("https://cdn.test/m")?.parse().ok()?;
            Some(ScriptedResponse::bytes(200, &vec![b'x'; 100 + i]))
        });
    }
}

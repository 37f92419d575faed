//! Mirrors remote deletions: anything in "Recently Deleted" loses its
//! checkpoint record and its local files.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{sleep_or_cancel, Cadence};
use crate::download::DownloadConfig;
use crate::icloud::photos::{PhotoAsset, PhotosService};
use crate::state::CheckpointStore;

pub struct AutoDeleter {
    service: Arc<PhotosService>,
    store: Arc<dyn CheckpointStore>,
    config: Arc<DownloadConfig>,
}

impl std::fmt::Debug for AutoDeleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoDeleter")
            .field("directory", &self.config.directory)
            .finish_non_exhaustive()
    }
}

impl AutoDeleter {
    pub fn new(
        service: Arc<PhotosService>,
        store: Arc<dyn CheckpointStore>,
        config: Arc<DownloadConfig>,
    ) -> Self {
        Self {
            service,
            store,
            config,
        }
    }

    /// Walk "Recently Deleted" from the start. Returns the number of local
    /// files removed.
    pub async fn sweep(&self) -> anyhow::Result<u64> {
        let album = self.service.recently_deleted();
        let removed = AtomicU64::new(0);
        let removed_ref = &removed;
        let this = self;
        album
            .walk_photos(0, move |_, page| async move {
                for asset in &page {
                    removed_ref.fetch_add(this.purge(asset).await?, Ordering::Relaxed);
                }
                Ok(())
            })
            .await?;
        let removed = removed.into_inner();
        tracing::info!(removed, "Recently deleted sweep finished");
        Ok(removed)
    }

    async fn purge(&self, asset: &PhotoAsset) -> anyhow::Result<u64> {
        if self.store.delete(asset.id()).await? {
            tracing::debug!(id = asset.id(), "Dropped checkpoint record");
        }
        let mut removed = 0;
        for path in self.config.candidate_paths(asset) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(id = asset.id(), path = %path.display(), "Deleted local file");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to delete {}", path.display())));
                }
            }
        }
        Ok(removed)
    }

    pub async fn run(&self, cadence: Cadence, cancel: CancellationToken) {
        loop {
            let result = tokio::select! {
                r = self.sweep() => r,
                _ = cancel.cancelled() => return,
            };
            let ok = match result {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(error = %e, "Recently deleted sweep failed");
                    false
                }
            };
            if !sleep_or_cancel(cadence.pause(ok), &cancel).await {
                return;
            }
        }
    }
}

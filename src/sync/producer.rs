//! Metadata producer: walks one album from its stored offset and records
//! every asset it finds as pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{sleep_or_cancel, Cadence, Wake};
use crate::icloud::photos::{Direction, PhotoAlbum, PhotosService};
use crate::state::CheckpointStore;

/// What one scan recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub pages: u64,
    pub seen: u64,
    pub added: u64,
    /// Logical offset after the last recorded page.
    pub offset: u64,
}

pub struct Producer {
    service: Arc<PhotosService>,
    album: String,
    direction: Direction,
    page_size: Option<usize>,
    store: Arc<dyn CheckpointStore>,
    wake: Arc<Wake>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("album", &self.album)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Offsets of the two directions are not interchangeable, so each gets its
/// own checkpoint row.
pub fn offset_key(album: &PhotoAlbum) -> String {
    match album.direction() {
        Direction::Ascending => album.name().to_string(),
        Direction::Descending => format!("{}#desc", album.name()),
    }
}

impl Producer {
    pub fn new(
        service: Arc<PhotosService>,
        album: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        wake: Arc<Wake>,
    ) -> Self {
        Self {
            service,
            album: album.into(),
            direction: Direction::Ascending,
            page_size: None,
            store,
            wake,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Resolved fresh on every scan so the album size is re-read.
    async fn resolve(&self) -> anyhow::Result<PhotoAlbum> {
        let album = self
            .service
            .album(&self.album)
            .await?
            .with_direction(self.direction);
        Ok(match self.page_size {
            Some(n) => album.with_page_size(n),
            None => album,
        })
    }

    /// Walk the album once from `start`, or from the stored offset. A
    /// library that is still indexing is left alone until the next scan.
    pub async fn scan(&self, start: Option<u64>) -> anyhow::Result<ScanReport> {
        self.service.check_indexing_state().await?;
        let album = self.resolve().await?;
        let key = offset_key(&album);
        let size = album.get_size().await?;
        let start = match start {
            Some(offset) => offset,
            None => self.store.get_offset(&key, size).await?,
        };
        tracing::info!(album = %album.name(), size, start, "Scanning album");

        let pages = AtomicU64::new(0);
        let seen = AtomicU64::new(0);
        let added = AtomicU64::new(0);
        let offset = AtomicU64::new(start);

        let key_ref = key.as_str();
        let store = &*self.store;
        let wake = &*self.wake;
        let (pages_ref, seen_ref, added_ref, offset_ref) = (&pages, &seen, &added, &offset);
        album
            .walk_photos(start, move |next, page| async move {
                let inserted = store.upsert_pending(&page).await?;
                store.save_offset(key_ref, next).await?;
                wake.notify();

                pages_ref.fetch_add(1, Ordering::Relaxed);
                seen_ref.fetch_add(page.len() as u64, Ordering::Relaxed);
                added_ref.fetch_add(inserted as u64, Ordering::Relaxed);
                offset_ref.store(next, Ordering::Relaxed);
                tracing::debug!(offset = next, seen = page.len(), inserted, "Recorded page");
                Ok(())
            })
            .await?;

        let report = ScanReport {
            pages: pages.into_inner(),
            seen: seen.into_inner(),
            added: added.into_inner(),
            offset: offset.into_inner(),
        };
        tracing::info!(
            album = %album.name(),
            pages = report.pages,
            seen = report.seen,
            added = report.added,
            offset = report.offset,
            "Scan finished"
        );
        Ok(report)
    }

    /// Scan forever on `cadence`. `start` overrides the stored offset for
    /// the first scan only.
    pub async fn run(&self, mut start: Option<u64>, cadence: Cadence, cancel: CancellationToken) {
        loop {
            let result = tokio::select! {
                r = self.scan(start.take()) => r,
                _ = cancel.cancelled() => return,
            };
            let ok = match result {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(album = %self.album, error = %e, "Album scan failed");
                    false
                }
            };
            if !sleep_or_cancel(cadence.pause(ok), &cancel).await {
                return;
            }
        }
    }
}

//! Checkpoint store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{AssetStatus, CheckpointSummary};
use crate::icloud::photos::PhotoAsset;

/// How long a saved scan offset stays valid.
pub const DEFAULT_OFFSET_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Durable producer/consumer handoff between the metadata sync and the
/// download scheduler.
///
/// Object safe, shared as `Arc<dyn CheckpointStore>`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Record assets as pending in one transaction. Ids already known keep
    /// their row untouched. Returns how many were new.
    async fn upsert_pending(&self, assets: &[PhotoAsset]) -> Result<usize, StateError>;

    /// Mark an asset done. Repeating it, or naming an unknown id, is a no-op.
    async fn mark_done(&self, id: &str) -> Result<(), StateError>;

    /// All pending assets, in no particular order.
    async fn list_pending(&self) -> Result<Vec<PhotoAsset>, StateError>;

    /// Forget an asset entirely. Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool, StateError>;

    /// Saved scan offset for `album`. Missing, expired, or larger than
    /// `album_size` reads as 0; an oversized offset is reset on disk.
    async fn get_offset(&self, album: &str, album_size: u64) -> Result<u64, StateError>;

    async fn save_offset(&self, album: &str, offset: u64) -> Result<(), StateError>;

    async fn summary(&self) -> Result<CheckpointSummary, StateError>;
}

pub struct SqliteCheckpointStore {
    /// rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
    offset_ttl: Duration,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore")
            .field("path", &self.path)
            .field("offset_ttl", &self.offset_ttl)
            .finish_non_exhaustive()
    }
}

impl SqliteCheckpointStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path, offset_ttl: Duration) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Sqlite)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Sqlite)?;
            schema::migrate(&mut conn)?;
            Ok::<_, StateError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Opened checkpoint store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            offset_ttl,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let mut conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            offset_ttl: DEFAULT_OFFSET_TTL,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }

    fn expired(&self, saved_at: i64, now: i64) -> bool {
        now.saturating_sub(saved_at) > self.offset_ttl.as_secs() as i64
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn upsert_pending(&self, assets: &[PhotoAsset]) -> Result<usize, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO assets (id, name, data, status, created_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4)
                     ON CONFLICT(id) DO NOTHING",
                )
                .map_err(StateError::query)?;
            for asset in assets {
                let data = serde_json::to_string(asset).map_err(|source| StateError::Encode {
                    id: asset.id().to_string(),
                    source,
                })?;
                inserted += stmt
                    .execute(rusqlite::params![
                        asset.id(),
                        asset.filename(false),
                        data,
                        asset.added_date().timestamp_millis(),
                    ])
                    .map_err(StateError::query)?;
            }
        }
        tx.commit().map_err(StateError::query)?;
        Ok(inserted)
    }

    async fn mark_done(&self, id: &str) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE assets SET status = ?1 WHERE id = ?2",
            rusqlite::params![AssetStatus::Done.as_str(), id],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PhotoAsset>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, data FROM assets WHERE status = ?1")
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([AssetStatus::Pending.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, data)| match PhotoAsset::from_bytes(data.as_bytes()) {
                Ok(asset) => Some(asset),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Skipping undecodable checkpoint row");
                    None
                }
            })
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool, StateError> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM assets WHERE id = ?1", [id])
            .map_err(StateError::query)?;
        Ok(removed > 0)
    }

    async fn get_offset(&self, album: &str, album_size: u64) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT scan_offset, saved_at FROM offsets WHERE album = ?1",
                [album],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let Some((offset, saved_at)) = row else {
            return Ok(0);
        };
        let now = Utc::now().timestamp();
        if self.expired(saved_at, now) {
            tracing::debug!(album, offset, "Saved offset expired, starting from 0");
            conn.execute("DELETE FROM offsets WHERE album = ?1", [album])
                .map_err(StateError::query)?;
            return Ok(0);
        }
        let offset = offset.max(0) as u64;
        if offset > album_size {
            tracing::info!(album, offset, album_size, "Saved offset beyond album size, reset to 0");
            conn.execute(
                "UPDATE offsets SET scan_offset = 0, saved_at = ?1 WHERE album = ?2",
                rusqlite::params![now, album],
            )
            .map_err(StateError::query)?;
            return Ok(0);
        }
        Ok(offset)
    }

    async fn save_offset(&self, album: &str, offset: u64) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO offsets (album, scan_offset, saved_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(album) DO UPDATE SET
                scan_offset = excluded.scan_offset,
                saved_at = excluded.saved_at",
            rusqlite::params![album, offset as i64, Utc::now().timestamp()],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn summary(&self) -> Result<CheckpointSummary, StateError> {
        let conn = self.lock()?;
        let count = |status: AssetStatus| -> Result<u64, StateError> {
            conn.query_row(
                "SELECT COUNT(*) FROM assets WHERE status = ?1",
                [status.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(StateError::query)
        };
        let pending = count(AssetStatus::Pending)?;
        let done = count(AssetStatus::Done)?;

        let now = Utc::now().timestamp();
        let mut stmt = conn
            .prepare("SELECT album, scan_offset, saved_at FROM offsets ORDER BY album")
            .map_err(StateError::query)?;
        let offsets = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?
            .into_iter()
            .filter(|(_, _, saved_at)| !self.expired(*saved_at, now))
            .map(|(album, offset, _)| (album, offset.max(0) as u64))
            .collect();

        Ok(CheckpointSummary {
            pending,
            done,
            offsets,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("claude")
            .join("checkpoint_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn asset(id: &str, name: &str) -> PhotoAsset {
        PhotoAsset::new(
            json!({
                "recordName": id,
                "created": {"timestamp": 1_700_000_000_000i64},
                "fields": {
                    "filenameEnc": {"value": name, "type": "STRING"},
                    "resOriginalRes": {"value": {"size": 10, "downloadURL": "https://cdn.test/x"}}
                }
            }),
            None,
        )
    }

    fn pending_ids(assets: &[PhotoAsset]) -> Vec<String> {
        let mut ids: Vec<String> = assets.iter().map(|a| a.id().to_string()).collect();
        ids.sort();
        ids
    }

    fn age_offset(store: &SqliteCheckpointStore, album: &str, secs: i64) {
        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE offsets SET saved_at = saved_at - ?1 WHERE album = ?2",
                rusqlite::params![secs, album],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_db() {
        let dir = test_dir("open_creates");
        let path = dir.join("state.db");
        let store = SqliteCheckpointStore::open(&path, DEFAULT_OFFSET_TTL)
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path);
    }

    #[tokio::test]
    async fn test_done_assets_leave_the_pending_set() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let inserted = store
            .upsert_pending(&[asset("A", "a.jpg"), asset("B", "b.jpg"), asset("C", "c.jpg")])
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        store.mark_done("B").await.unwrap();
        store.mark_done("B").await.unwrap();
        store.mark_done("unknown").await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending_ids(&pending), ["A", "C"]);
        let summary = store.summary().await.unwrap();
        assert_eq!((summary.pending, summary.done), (2, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mark_done() {
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let ids: Vec<String> = (0..32).map(|i| format!("A{i:02}")).collect();
        let assets: Vec<PhotoAsset> = ids.iter().map(|id| asset(id, "x.jpg")).collect();
        store.upsert_pending(&assets).await.unwrap();

        let tasks = ids.iter().take(24).cloned().map(|id| {
            let store = store.clone();
            tokio::spawn(async move { store.mark_done(&id).await })
        });
        for result in futures_util::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let summary = store.summary().await.unwrap();
        assert_eq!((summary.pending, summary.done), (8, 24));
        assert_eq!(pending_ids(&store.list_pending().await.unwrap()), &ids[24..]);
    }

    #[tokio::test]
    async fn test_first_seen_wins() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.upsert_pending(&[asset("A", "first.jpg")]).await.unwrap();
        store.mark_done("A").await.unwrap();

        let inserted = store
            .upsert_pending(&[asset("A", "second.jpg"), asset("B", "b.jpg")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending_ids(&pending), ["B"]);
        let name: String = store
            .lock()
            .unwrap()
            .query_row("SELECT name FROM assets WHERE id = 'A'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "first.jpg");
    }

    #[tokio::test]
    async fn test_pending_payload_round_trips() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.upsert_pending(&[asset("A", "a.jpg")]).await.unwrap();
        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending[0].filename(false), "a.jpg");
        assert_eq!(pending[0].size(), 10);
        assert_eq!(pending[0].added_date().timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_undecodable_rows_are_skipped() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.upsert_pending(&[asset("A", "a.jpg")]).await.unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO assets (id, name, data, status, created_at) VALUES ('X', 'x', 'not json', 'pending', 0)",
                [],
            )
            .unwrap();
        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending_ids(&pending), ["A"]);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.upsert_pending(&[asset("A", "a.jpg")]).await.unwrap();
        assert!(store.delete("A").await.unwrap());
        assert!(!store.delete("A").await.unwrap());
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offset_round_trips_within_size() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        assert_eq!(store.get_offset("All Photos", 100).await.unwrap(), 0);
        store.save_offset("All Photos", 40).await.unwrap();
        assert_eq!(store.get_offset("All Photos", 100).await.unwrap(), 40);
        assert_eq!(store.get_offset("All Photos", 40).await.unwrap(), 40);
        assert_eq!(store.get_offset("Videos", 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offset_beyond_size_resets_and_persists() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.save_offset("All Photos", 40).await.unwrap();
        assert_eq!(store.get_offset("All Photos", 39).await.unwrap(), 0);
        // the reset sticks even when the album grows back
        assert_eq!(store.get_offset("All Photos", 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offset_expires_after_ttl() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.save_offset("All Photos", 40).await.unwrap();
        age_offset(&store, "All Photos", 11 * 3600);
        assert_eq!(store.get_offset("All Photos", 100).await.unwrap(), 40);
        age_offset(&store, "All Photos", 2 * 3600);
        assert_eq!(store.get_offset("All Photos", 100).await.unwrap(), 0);
        assert!(store.summary().await.unwrap().offsets.is_empty());
    }

    #[tokio::test]
    async fn test_summary_lists_live_offsets() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.save_offset("Videos", 3).await.unwrap();
        store.save_offset("All Photos", 7).await.unwrap();
        let summary = store.summary().await.unwrap();
        assert_eq!(
            summary.offsets,
            [("All Photos".to_string(), 7), ("Videos".to_string(), 3)]
        );
    }
}

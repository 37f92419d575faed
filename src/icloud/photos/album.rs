use std::collections::{HashMap, VecDeque};
use std::future::Future;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::asset::PhotoAsset;
use super::cloudkit::{BatchQueryResponse, QueryResponse};
use super::error::PhotosError;
use super::queries::{count_query, list_query};
use super::ServiceContext;

/// Largest page the records endpoint serves.
pub const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }
}

/// What to ask the records endpoint for when listing one album.
#[derive(Debug, Clone, Default)]
pub struct AlbumQuery {
    /// Index used for the count lookup.
    pub obj_type: String,
    /// Record type of the listing query.
    pub list_type: String,
    pub direction: Direction,
    /// Extra `filterBy` entries appended after rank and direction.
    pub filters: Vec<Value>,
}

pub struct PhotoAlbum {
    name: String,
    query: AlbumQuery,
    ctx: ServiceContext,
    page_size: usize,
    size: Mutex<Option<u64>>,
}

impl std::fmt::Debug for PhotoAlbum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoAlbum")
            .field("name", &self.name)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

impl PhotoAlbum {
    pub(crate) fn new(ctx: ServiceContext, name: String, query: AlbumQuery) -> Self {
        Self {
            name,
            query,
            ctx,
            page_size: MAX_PAGE_SIZE,
            size: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.query.direction
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.query.direction = direction;
        self
    }

    /// Page size used by iteration and walks, clamped to `1..=200`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Number of items in the album. Fetched once; concurrent first callers
    /// wait on the same lookup.
    pub async fn get_size(&self) -> Result<u64, PhotosError> {
        let mut cached = self.size.lock().await;
        if let Some(size) = *cached {
            return Ok(size);
        }
        let size = self.fetch_size().await?;
        debug!(album = %self.name, size, "Fetched album size");
        *cached = Some(size);
        Ok(size)
    }

    async fn fetch_size(&self) -> Result<u64, PhotosError> {
        let resp: BatchQueryResponse = self
            .ctx
            .post(
                "internal/records/query/batch",
                count_query(&self.query.obj_type),
                "album size",
            )
            .await?;
        resp.batch
            .into_iter()
            .next()
            .and_then(|b| b.records.into_iter().next())
            .map(|r| r.fields["itemCount"]["value"].as_u64().unwrap_or(0))
            .ok_or_else(|| PhotosError::EmptyCount(self.query.obj_type.clone()))
    }

    /// One page of assets starting at `rank`. Each `CPLMaster` is joined
    /// with the `CPLAsset` overlay that references it. A negative rank is
    /// past the end of a descending listing and yields an empty page.
    pub async fn get_photos_by_offset(
        &self,
        rank: i64,
        limit: usize,
    ) -> Result<Vec<PhotoAsset>, PhotosError> {
        if rank < 0 {
            return Ok(Vec::new());
        }
        let body = list_query(
            rank,
            self.query.direction.as_str(),
            limit.clamp(1, MAX_PAGE_SIZE),
            &self.query.list_type,
            &self.query.filters,
        );
        let resp: QueryResponse = self.ctx.post("records/query", body, "album page").await?;

        let mut overlays: HashMap<String, Value> = HashMap::new();
        let mut masters: Vec<Value> = Vec::new();
        for record in resp.records {
            match record["recordType"].as_str() {
                Some("CPLAsset") => {
                    let master = record["fields"]["masterRef"]["value"]["recordName"]
                        .as_str()
                        .map(str::to_string);
                    if let Some(master) = master {
                        overlays.insert(master, record);
                    }
                }
                Some("CPLMaster") => masters.push(record),
                _ => {}
            }
        }

        Ok(masters
            .into_iter()
            .map(|master| {
                let overlay = master["recordName"]
                    .as_str()
                    .and_then(|name| overlays.remove(name));
                PhotoAsset::new(master, overlay)
            })
            .collect())
    }

    /// Rank following a page of `page_len` items fetched at `rank`.
    pub fn cal_offset(&self, rank: i64, page_len: usize) -> i64 {
        match self.query.direction {
            Direction::Ascending => rank + page_len as i64,
            Direction::Descending => rank - page_len as i64,
        }
    }

    fn rank_for(&self, offset: u64, size: u64) -> i64 {
        match self.query.direction {
            Direction::Ascending => offset as i64,
            Direction::Descending => size as i64 - 1 - offset as i64,
        }
    }

    fn offset_for(&self, rank: i64, size: u64) -> u64 {
        match self.query.direction {
            Direction::Ascending => rank.max(0) as u64,
            Direction::Descending => (size as i64 - 1 - rank).max(0) as u64,
        }
    }

    /// Size is only needed to translate offsets of descending listings.
    async fn size_for_direction(&self) -> Result<u64, PhotosError> {
        match self.query.direction {
            Direction::Ascending => Ok(0),
            Direction::Descending => self.get_size().await,
        }
    }

    /// Lazily iterate assets from the logical `start_offset`.
    pub fn photos_iter(&self, start_offset: u64) -> PhotosIter<'_> {
        PhotosIter {
            album: self,
            start_offset,
            rank: None,
            buffer: VecDeque::new(),
            finished: false,
        }
    }

    /// Fetch pages from `start_offset` until an empty page, handing each to
    /// `callback` with the logical offset that follows it. A callback error
    /// stops the walk and is returned.
    pub async fn walk_photos<F, Fut>(&self, start_offset: u64, mut callback: F) -> anyhow::Result<()>
    where
        F: FnMut(u64, Vec<PhotoAsset>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let size = self.size_for_direction().await?;
        let mut rank = self.rank_for(start_offset, size);
        loop {
            let page = self.get_photos_by_offset(rank, self.page_size).await?;
            debug!(
                album = %self.name,
                rank,
                got = page.len(),
                direction = self.query.direction.as_str(),
                "Walked page"
            );
            if page.is_empty() {
                return Ok(());
            }
            rank = self.cal_offset(rank, page.len());
            callback(self.offset_for(rank, size), page).await?;
        }
    }

    /// The first `count` assets of the album in listing order.
    pub async fn get_photos_by_count(&self, count: usize) -> Result<Vec<PhotoAsset>, PhotosError> {
        let mut iter = self.photos_iter(0);
        let mut assets = Vec::with_capacity(count.min(self.page_size));
        while assets.len() < count {
            match iter.next().await? {
                Some(asset) => assets.push(asset),
                None => break,
            }
        }
        Ok(assets)
    }
}

/// Page-at-a-time cursor over an album. `next` yields `Ok(None)` once an
/// empty page has been seen.
pub struct PhotosIter<'a> {
    album: &'a PhotoAlbum,
    start_offset: u64,
    rank: Option<i64>,
    buffer: VecDeque<PhotoAsset>,
    finished: bool,
}

impl PhotosIter<'_> {
    pub async fn next(&mut self) -> Result<Option<PhotoAsset>, PhotosError> {
        loop {
            if let Some(asset) = self.buffer.pop_front() {
                return Ok(Some(asset));
            }
            if self.finished {
                return Ok(None);
            }
            let rank = match self.rank {
                Some(rank) => rank,
                None => {
                    let size = self.album.size_for_direction().await?;
                    self.album.rank_for(self.start_offset, size)
                }
            };
            let page = self
                .album
                .get_photos_by_offset(rank, self.album.page_size)
                .await?;
            if page.is_empty() {
                self.finished = true;
                return Ok(None);
            }
            self.rank = Some(self.album.cal_offset(rank, page.len()));
            self.buffer.extend(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use serde_json::json;

    use super::*;
    use crate::gateway::testing::{FakeGateway, ScriptedResponse};
    use crate::icloud::photos::testing::{master_id, serve_count, serve_library, service};

    const LIST: &str = "CPLAssetAndMasterByAddedDate";

    fn library(size: usize) -> Arc<FakeGateway> {
        let fake = Arc::new(FakeGateway::new());
        serve_library(&fake, LIST, size);
        serve_count(&fake, size as u64);
        fake
    }

    async fn walk(album: &PhotoAlbum, start: u64) -> (Vec<String>, Vec<u64>) {
        let ids = Arc::new(StdMutex::new(Vec::new()));
        let offsets = Arc::new(StdMutex::new(Vec::new()));
        album
            .walk_photos(start, |offset, page| {
                let ids = ids.clone();
                let offsets = offsets.clone();
                async move {
                    offsets.lock().unwrap().push(offset);
                    ids.lock()
                        .unwrap()
                        .extend(page.iter().map(|a| a.id().to_string()));
                    anyhow::Ok(())
                }
            })
            .await
            .unwrap();
        let ids = ids.lock().unwrap().clone();
        let offsets = offsets.lock().unwrap().clone();
        (ids, offsets)
    }

    #[tokio::test]
    async fn test_ascending_walk_visits_every_asset_in_order() {
        let fake = library(10);
        let album = service(&fake).all().with_page_size(3);
        let (ids, offsets) = walk(&album, 0).await;
        let expected: Vec<String> = (0..10).map(master_id).collect();
        assert_eq!(ids, expected);
        assert_eq!(offsets, [3, 6, 9, 10]);
        // no count lookup for ascending listings
        assert!(fake.call_urls().iter().all(|u| !u.contains("batch")));
    }

    #[tokio::test]
    async fn test_descending_walk_is_the_reverse() {
        let fake = library(10);
        let album = service(&fake)
            .all()
            .with_page_size(3)
            .with_direction(Direction::Descending);
        let (ids, offsets) = walk(&album, 0).await;
        let expected: Vec<String> = (0..10).rev().map(master_id).collect();
        assert_eq!(ids, expected);
        assert_eq!(offsets, [3, 6, 9, 10]);
    }

    #[tokio::test]
    async fn test_walk_resumes_from_offset() {
        let fake = library(10);
        let album = service(&fake).all().with_page_size(4);
        let (ids, _) = walk(&album, 7).await;
        assert_eq!(ids, ["m007", "m008", "m009"]);

        let album = service(&fake)
            .all()
            .with_page_size(4)
            .with_direction(Direction::Descending);
        let (ids, _) = walk(&album, 7).await;
        assert_eq!(ids, ["m002", "m001", "m000"]);
    }

    #[tokio::test]
    async fn test_callback_error_stops_walk() {
        let fake = library(10);
        let album = service(&fake).all().with_page_size(3);
        let calls = Arc::new(StdMutex::new(0));
        let err = album
            .walk_photos(0, |_, _| {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err::<(), _>(anyhow::anyhow!("disk full"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(fake.call_count(), 1);
    }

    #[tokio::test]
    async fn test_iterator_ends_on_empty_page() {
        let fake = library(5);
        let album = service(&fake).all().with_page_size(2);
        let mut iter = album.photos_iter(0);
        let mut ids = Vec::new();
        while let Some(asset) = iter.next().await.unwrap() {
            ids.push(asset.id().to_string());
        }
        assert_eq!(ids.len(), 5);
        assert!(iter.next().await.unwrap().is_none());
        // pages of 2, 2, 1 and the empty sentinel
        assert_eq!(fake.call_count(), 4);
    }

    #[tokio::test]
    async fn test_iterator_surfaces_transport_errors() {
        let fake = Arc::new(FakeGateway::new());
        let album = service(&fake).all();
        let mut iter = album.photos_iter(0);
        let err = iter.next().await.unwrap_err();
        assert!(err.gateway().is_some_and(|e| e.is_timeout()));
    }

    #[tokio::test]
    async fn test_photos_by_count_stops_early() {
        let fake = library(10);
        let album = service(&fake).all().with_page_size(4);
        let assets = album.get_photos_by_count(5).await.unwrap();
        let ids: Vec<&str> = assets.iter().map(|a| a.id()).collect();
        assert_eq!(ids, ["m000", "m001", "m002", "m003", "m004"]);
        assert_eq!(fake.call_count(), 2);
    }

    #[tokio::test]
    async fn test_page_joins_overlay_by_master_ref() {
        let fake = Arc::new(FakeGateway::new());
        fake.push(
            "/records/query",
            ScriptedResponse::json(
                200,
                json!({"records": [
                    {"recordName": "A1", "recordType": "CPLAsset", "fields": {
                        "masterRef": {"value": {"recordName": "M2"}},
                        "assetDate": {"value": 1000}
                    }},
                    {"recordName": "M1", "recordType": "CPLMaster", "created": {"timestamp": 5000}},
                    {"recordName": "M2", "recordType": "CPLMaster", "created": {"timestamp": 5000}}
                ]}),
            ),
        );
        let album = service(&fake).all();
        let page = album.get_photos_by_offset(0, 500).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].asset_date().timestamp_millis(), 5000);
        assert_eq!(page[1].asset_date().timestamp_millis(), 1000);

        let calls = fake.calls.lock().unwrap();
        let crate::gateway::RequestBody::Json(body) = calls[0].body.clone().unwrap() else {
            panic!("expected json body");
        };
        assert_eq!(body["resultsLimit"], 200);
    }

    #[tokio::test]
    async fn test_size_is_fetched_once() {
        let fake = library(7);
        let album = service(&fake).all();
        assert_eq!(album.get_size().await.unwrap(), 7);
        assert_eq!(album.get_size().await.unwrap(), 7);
        assert_eq!(fake.call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_size_lookups_share_one_fetch() {
        let fake = library(7);
        let album = service(&fake).all();

        let sizes = futures_util::future::join_all((0..8).map(|_| album.get_size())).await;

        assert_eq!(fake.call_count(), 1);
        assert!(sizes.into_iter().all(|s| s.unwrap() == 7));
    }

    #[tokio::test]
    async fn test_empty_count_batch_is_an_error() {
        let fake = Arc::new(FakeGateway::new());
        fake.push(
            "/internal/records/query/batch",
            ScriptedResponse::json(200, json!({"batch": [{"records": []}]})),
        );
        let album = service(&fake).all();
        assert!(matches!(
            album.get_size().await,
            Err(PhotosError::EmptyCount(_))
        ));
    }

    #[test]
    fn test_cal_offset_follows_direction() {
        let fake = Arc::new(FakeGateway::new());
        let asc = service(&fake).all();
        assert_eq!(asc.cal_offset(10, 4), 14);
        let desc = service(&fake).all().with_direction(Direction::Descending);
        assert_eq!(desc.cal_offset(10, 4), 6);
    }
}

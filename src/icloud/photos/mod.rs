//! Photos service: album catalogue and rank based paging over iCloud's
//! CloudKit photos database.

mod album;
mod asset;
pub mod cloudkit;
pub mod error;
pub mod queries;
mod smart_folders;
mod upload;

pub use album::{AlbumQuery, Direction, PhotoAlbum};
pub use asset::{AssetVersion, PhotoAsset};
pub use error::PhotosError;
pub use smart_folders::{ALL_PHOTOS, RECENTLY_DELETED};

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::gateway::{GatewayRequest, SessionClient};
use cloudkit::{QueryResponse, Record};
use smart_folders::{smart_folders, user_folder};

const CLIENT_BUILD_NUMBER: &str = "2522Project44";
const CLIENT_MASTERING_NUMBER: &str = "2522B2";

/// Endpoint and query parameters shared by every album of one service.
#[derive(Clone)]
pub(crate) struct ServiceContext {
    client: SessionClient,
    endpoint: String,
    params: Arc<[(String, String)]>,
}

impl ServiceContext {
    /// POST a JSON body to `{endpoint}/{path}` and decode the reply.
    pub(crate) async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        what: &'static str,
    ) -> Result<T, PhotosError> {
        let request = GatewayRequest::post(format!("{}/{path}", self.endpoint))
            .header("Content-Type", "text/plain")
            .queries(&self.params)
            .json(body);
        let text = self
            .client
            .request(&request)
            .await
            .map_err(|source| PhotosError::Request { what, source })?;
        serde_json::from_str(&text).map_err(|source| PhotosError::Json { what, source })
    }
}

pub struct PhotosService {
    ctx: ServiceContext,
    upload_root: Option<String>,
}

impl std::fmt::Debug for PhotosService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotosService")
            .field("endpoint", &self.ctx.endpoint)
            .finish_non_exhaustive()
    }
}

impl PhotosService {
    /// `service_root` is the account's `ckdatabasews` URL; `params` are
    /// appended to every query on top of the fixed sync flags.
    pub fn new(client: SessionClient, service_root: &str, params: Vec<(String, String)>) -> Self {
        let mut params = params;
        params.push(("remapEnums".to_string(), "true".to_string()));
        params.push(("getCurrentSyncToken".to_string(), "true".to_string()));
        Self {
            ctx: ServiceContext {
                client,
                endpoint: format!(
                    "{}/database/1/com.apple.photos.cloud/production/private",
                    service_root.trim_end_matches('/')
                ),
                params: params.into(),
            },
            upload_root: None,
        }
    }

    /// The per-account parameters every photos query carries.
    pub fn common_params(client_id: &str, dsid: Option<&str>) -> Vec<(String, String)> {
        let mut params = vec![
            (
                "clientBuildNumber".to_string(),
                CLIENT_BUILD_NUMBER.to_string(),
            ),
            (
                "clientMasteringNumber".to_string(),
                CLIENT_MASTERING_NUMBER.to_string(),
            ),
            ("clientId".to_string(), client_id.to_string()),
        ];
        if let Some(dsid) = dsid {
            params.push(("dsid".to_string(), dsid.to_string()));
        }
        params
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> &str {
        &self.ctx.endpoint
    }

    /// Refuse to page a library that is still being indexed. A lookup that
    /// returns no state record at all counts as ready.
    pub async fn check_indexing_state(&self) -> Result<(), PhotosError> {
        let resp: QueryResponse<Record> = self
            .ctx
            .post("records/query", queries::indexing_state_query(), "indexing state")
            .await?;
        let Some(record) = resp.records.first() else {
            debug!("No indexing state record, assuming the library is ready");
            return Ok(());
        };
        let state = record.fields["state"]["value"].as_str().unwrap_or_default();
        if state == "FINISHED" {
            return Ok(());
        }
        warn!(state, "Photo library is still indexing");
        Err(PhotosError::IndexingNotFinished(state.to_string()))
    }

    fn album_from(&self, name: &str, query: AlbumQuery) -> PhotoAlbum {
        PhotoAlbum::new(self.ctx.clone(), name.to_string(), query)
    }

    /// Built-in albums plus the account's user folders.
    pub async fn albums(&self) -> Result<HashMap<String, PhotoAlbum>, PhotosError> {
        let mut albums: HashMap<String, PhotoAlbum> = smart_folders()
            .into_iter()
            .map(|(name, def)| (name.to_string(), self.album_from(name, def.query())))
            .collect();

        for record in self.fetch_folders().await? {
            if let Some((name, query)) = user_folder(&record) {
                let album = self.album_from(&name, query);
                albums.insert(name, album);
            }
        }
        debug!(count = albums.len(), "Loaded album catalogue");
        Ok(albums)
    }

    /// Look up one album by name. An empty name means "All Photos"; built-in
    /// names resolve without a network call.
    pub async fn album(&self, name: &str) -> Result<PhotoAlbum, PhotosError> {
        let name = if name.is_empty() { ALL_PHOTOS } else { name };
        if let Some((n, def)) = smart_folders().into_iter().find(|(n, _)| *n == name) {
            return Ok(self.album_from(n, def.query()));
        }
        self.albums()
            .await?
            .remove(name)
            .ok_or_else(|| PhotosError::AlbumNotFound(name.to_string()))
    }

    #[cfg(test)]
    pub fn all(&self) -> PhotoAlbum {
        self.builtin(ALL_PHOTOS)
    }

    pub fn recently_deleted(&self) -> PhotoAlbum {
        self.builtin(RECENTLY_DELETED)
    }

    fn builtin(&self, name: &'static str) -> PhotoAlbum {
        let query = smart_folders()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, def)| def.query())
            .unwrap_or_default();
        self.album_from(name, query)
    }

    async fn fetch_folders(&self) -> Result<Vec<Record>, PhotosError> {
        let resp: QueryResponse<Record> = self
            .ctx
            .post("records/query", queries::folders_query(), "folders")
            .await?;
        Ok(resp.records)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::Engine;
    use serde_json::json;

    use super::testing::{serve_indexing_state, service};
    use super::*;
    use crate::gateway::testing::{FakeGateway, ScriptedResponse};

    #[test]
    fn test_endpoint_and_params() {
        let fake = Arc::new(FakeGateway::new());
        let svc = service(&fake);
        assert_eq!(
            svc.endpoint(),
            "https://ck.test/database/1/com.apple.photos.cloud/production/private"
        );
        let keys: Vec<&str> = svc.ctx.params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            [
                "clientBuildNumber",
                "clientMasteringNumber",
                "clientId",
                "dsid",
                "remapEnums",
                "getCurrentSyncToken"
            ]
        );
    }

    #[tokio::test]
    async fn test_builtin_album_needs_no_request() {
        let fake = Arc::new(FakeGateway::new());
        let svc = service(&fake);
        let album = svc.album("").await.unwrap();
        assert_eq!(album.name(), ALL_PHOTOS);
        let deleted = svc.album(RECENTLY_DELETED).await.unwrap();
        assert_eq!(deleted.name(), RECENTLY_DELETED);
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_user_folder_is_resolved() {
        let fake = Arc::new(FakeGateway::new());
        let name = base64::engine::general_purpose::STANDARD.encode("Trip");
        fake.push(
            "/records/query",
            ScriptedResponse::json(
                200,
                json!({"records": [
                    {"recordName": "----Root-Folder----", "fields": {}},
                    {"recordName": "F1", "fields": {"albumNameEnc": {"value": name}}}
                ]}),
            ),
        );
        let svc = service(&fake);
        let album = svc.album("Trip").await.unwrap();
        assert_eq!(album.name(), "Trip");
        let call = &fake.calls.lock().unwrap()[0];
        assert!(call.query.iter().any(|(k, v)| k == "dsid" && v == "42"));
    }

    #[tokio::test]
    async fn test_unknown_album_is_an_error() {
        let fake = Arc::new(FakeGateway::new());
        fake.push("/records/query", ScriptedResponse::json(200, json!({"records": []})));
        let svc = service(&fake);
        let err = svc.album("Nope").await.unwrap_err();
        assert!(matches!(err, PhotosError::AlbumNotFound(ref n) if n == "Nope"));
        assert_eq!(err.to_string(), "album Nope not found");
    }

    #[tokio::test]
    async fn test_finished_library_passes_indexing_check() {
        let fake = Arc::new(FakeGateway::new());
        serve_indexing_state(&fake, "FINISHED");
        let svc = service(&fake);
        svc.check_indexing_state().await.unwrap();

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].url.ends_with("/private/records/query"));
        let Some(crate::gateway::RequestBody::Json(body)) = &calls[0].body else {
            panic!("expected a JSON body");
        };
        assert_eq!(body["query"]["recordType"], "CheckIndexingState");
        assert_eq!(body["zoneID"]["zoneName"], "PrimarySync");
    }

    #[tokio::test]
    async fn test_running_index_is_refused() {
        let fake = Arc::new(FakeGateway::new());
        serve_indexing_state(&fake, "RUNNING");
        let err = service(&fake).check_indexing_state().await.unwrap_err();
        assert!(matches!(err, PhotosError::IndexingNotFinished(ref s) if s == "RUNNING"));
        assert!(err.to_string().contains("not finished indexing"));
    }

    #[tokio::test]
    async fn test_missing_indexing_record_counts_as_ready() {
        let fake = Arc::new(FakeGateway::new());
        fake.push("/records/query", ScriptedResponse::json(200, json!({"records": []})));
        service(&fake).check_indexing_state().await.unwrap();
    }
}

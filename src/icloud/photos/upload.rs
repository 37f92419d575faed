//! Single-file upload through the account's `uploadimagews` service.

use serde::Deserialize;

use super::{PhotosError, PhotosService};
use crate::gateway::GatewayRequest;

/// Reply to one upload. Apple keeps the first copy of identical content and
/// reports later uploads of it as duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    #[serde(default)]
    pub is_duplicate: bool,
}

impl PhotosService {
    /// `root` is the account's `uploadimagews` URL.
    pub fn with_upload_root(mut self, root: &str) -> Self {
        self.upload_root = Some(root.trim_end_matches('/').to_string());
        self
    }

    /// Upload one file's content under `filename`.
    pub async fn upload(
        &self,
        filename: &str,
        body: Vec<u8>,
    ) -> Result<UploadOutcome, PhotosError> {
        let root = self
            .upload_root
            .as_deref()
            .ok_or(PhotosError::UploadUnavailable)?;
        let size = body.len();
        let request = GatewayRequest::post(format!("{root}/upload"))
            .header("Content-Type", "text/plain")
            .query("filename", filename)
            .bytes(body)
            .expect(&[200]);
        let text = self
            .ctx
            .client
            .request(&request)
            .await
            .map_err(|source| PhotosError::Request {
                what: "upload",
                source,
            })?;
        let outcome: UploadOutcome = serde_json::from_str(&text).map_err(|source| {
            PhotosError::Json {
                what: "upload",
                source,
            }
        })?;
        tracing::debug!(filename, size, duplicate = outcome.is_duplicate, "Uploaded file");
        Ok(outcome)
    }
}

use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum PhotosError {
    #[error("album {0} not found")]
    AlbumNotFound(String),

    #[error("{what} request failed")]
    Request {
        what: &'static str,
        #[source]
        source: GatewayError,
    },

    #[error("failed to decode {what} response")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("iCloud Photo Library has not finished indexing (state {0}), try again in a few minutes")]
    IndexingNotFinished(String),

    #[error("no upload service configured for this account")]
    UploadUnavailable,

    #[error("index count lookup for {0} returned no records")]
    EmptyCount(String),
}

impl PhotosError {
    /// The transport error behind a failed request, if any.
    pub fn gateway(&self) -> Option<&GatewayError> {
        match self {
            PhotosError::Request { source, .. } => Some(source),
            _ => None,
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::gateway::http::write_private;

/// Shared handle to the live session. Reads happen on every call (auth
/// headers), writes only when a response carries session headers.
pub type SharedSession = Arc<tokio::sync::RwLock<SessionData>>;

/// Sanitize a username by keeping only word characters (alphanumeric + underscore).
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Session fields Apple hands back in response headers, plus the OAuth
/// client id we generate once and keep reusing.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scnt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl std::fmt::Debug for SessionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("SessionData")
            .field("session_token", &redact(&self.session_token))
            .field("session_id", &redact(&self.session_id))
            .field("scnt", &redact(&self.scnt))
            .field("account_country", &self.account_country)
            .field("trust_token", &redact(&self.trust_token))
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl SessionData {
    pub fn has_token(&self) -> bool {
        self.session_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Overwrite every field the patch carries; leave the rest alone.
    pub fn apply(&mut self, patch: SessionPatch) {
        let SessionPatch {
            session_token,
            session_id,
            scnt,
            account_country,
            trust_token,
        } = patch;
        if session_token.is_some() {
            self.session_token = session_token;
        }
        if session_id.is_some() {
            self.session_id = session_id;
        }
        if scnt.is_some() {
            self.scnt = scnt;
        }
        if account_country.is_some() {
            self.account_country = account_country;
        }
        if trust_token.is_some() {
            if self.trust_token != trust_token {
                tracing::debug!("Trust token rotated");
            }
            self.trust_token = trust_token;
        }
    }
}

/// Field updates extracted from one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub session_token: Option<String>,
    pub session_id: Option<String>,
    pub scnt: Option<String>,
    pub account_country: Option<String>,
    pub trust_token: Option<String>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        *self == SessionPatch::default()
    }

    fn set(&mut self, field: SessionField, value: String) {
        let slot = match field {
            SessionField::AccountCountry => &mut self.account_country,
            SessionField::SessionId => &mut self.session_id,
            SessionField::SessionToken => &mut self.session_token,
            SessionField::TrustToken => &mut self.trust_token,
            SessionField::Scnt => &mut self.scnt,
        };
        *slot = Some(value);
    }
}

#[derive(Debug, Clone, Copy)]
enum SessionField {
    AccountCountry,
    SessionId,
    SessionToken,
    TrustToken,
    Scnt,
}

/// Apple's auth APIs return session state in custom HTTP headers.
const HEADER_DATA: &[(&str, SessionField)] = &[
    ("X-Apple-ID-Account-Country", SessionField::AccountCountry),
    ("X-Apple-ID-Session-Id", SessionField::SessionId),
    ("X-Apple-Session-Token", SessionField::SessionToken),
    ("X-Apple-TwoSV-Trust-Token", SessionField::TrustToken),
    ("scnt", SessionField::Scnt),
];

/// Pure header scan; empty or non-UTF-8 values are ignored.
pub fn session_patch_from_headers(headers: &HeaderMap) -> SessionPatch {
    let mut patch = SessionPatch::default();
    for &(header_name, field) in HEADER_DATA {
        let value = headers
            .get(header_name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        if let Some(value) = value {
            patch.set(field, value.to_string());
        }
    }
    patch
}

/// On-disk home of [`SessionData`]: `{cookie_dir}/{account}.session`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(cookie_dir: &Path, username: &str) -> Self {
        Self {
            path: cookie_dir.join(format!("{}.session", sanitize_username(username))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or corrupt files yield an empty session.
    pub async fn load(&self) -> SessionData {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => {
                    tracing::debug!(path = %self.path.display(), "Loaded session data");
                    data
                }
                Err(e) => {
                    tracing::info!(error = %e, "Session file corrupt, starting fresh");
                    SessionData::default()
                }
            },
            Err(_) => {
                tracing::info!("Session file does not exist");
                SessionData::default()
            }
        }
    }

    pub async fn save(&self, data: &SessionData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(data)?;
        write_private(&self.path, &json)
            .await
            .with_context(|| format!("Failed to save session to {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), "Saved session data");
        Ok(())
    }
}

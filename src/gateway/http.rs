use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Client, Method, Response};
use tokio::fs;
use tokio::sync::Mutex;

use super::{GatewayError, GatewayRequest, RawResponse, RequestBody, RequestGateway, StreamResponse};
use crate::auth::session::sanitize_username;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// Check if a Set-Cookie header string represents an expired cookie.
fn is_cookie_expired(cookie_str: &str, now: &chrono::DateTime<chrono::Utc>) -> bool {
    if let Ok(parsed) = cookie::Cookie::parse(cookie_str) {
        if let Some(expires) = parsed.expires_datetime() {
            let expires_utc =
                chrono::DateTime::<chrono::Utc>::from(std::time::SystemTime::from(expires));
            return expires_utc < *now;
        }
    }
    false
}

fn cookie_name(cookie_str: &str) -> &str {
    cookie_str.split('=').next().unwrap_or("").trim()
}

/// A single persisted cookie entry (URL + Set-Cookie header value).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CookieEntry {
    url: String,
    cookie: String,
}

/// reqwest-backed gateway. Cookies survive restarts through a JSON jar file
/// next to the session file; an advisory lock keeps a second process for the
/// same account out.
pub struct HttpGateway {
    client: Client,
    cookie_path: PathBuf,
    /// In-memory mirror of the jar file, guarding read-modify-write.
    cookie_entries: Mutex<Vec<CookieEntry>>,
    /// Held for the lifetime of the gateway; dropping it releases the lock.
    _lock_file: std::fs::File,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("cookie_path", &self.cookie_path)
            .finish_non_exhaustive()
    }
}

impl HttpGateway {
    pub async fn new(
        cookie_dir: &Path,
        username: &str,
        home_endpoint: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let sanitized = sanitize_username(username);
        fs::create_dir_all(cookie_dir).await.with_context(|| {
            format!(
                "Failed to create cookie directory: {}",
                cookie_dir.display()
            )
        })?;

        let lock_path = cookie_dir.join(format!("{sanitized}.lock"));
        let lock_file = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&lock_path).with_context(|| {
                format!("Failed to create lock file: {}", lock_path.display())
            })?;
            file.try_lock_exclusive().map_err(|_| {
                anyhow::anyhow!(
                    "Another icloud-photo-sync instance is running for this account (lock: {})",
                    lock_path.display()
                )
            })?;
            Ok::<std::fs::File, anyhow::Error>(file)
        })
        .await??;

        let cookie_jar = Arc::new(reqwest::cookie::Jar::default());
        let cookie_path = cookie_dir.join(&sanitized);
        let entries = load_cookie_entries(&cookie_path).await;
        for entry in &entries {
            if let Ok(url) = entry.url.parse::<url::Url>() {
                cookie_jar.add_cookie_str(&entry.cookie, &url);
            }
        }

        // Apple's CORS checks require Origin/Referer on every call
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ORIGIN, HeaderValue::from_str(home_endpoint)?);
        default_headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{home_endpoint}/"))?,
        );
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        let client = Client::builder()
            .cookie_provider(cookie_jar)
            .default_headers(default_headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            cookie_path,
            cookie_entries: Mutex::new(entries),
            _lock_file: lock_file,
        })
    }

    fn build(&self, request: &GatewayRequest) -> Result<reqwest::RequestBuilder, GatewayError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| GatewayError::InvalidHeader { name: name.clone() })?;
            let value = HeaderValue::from_str(value).map_err(|_| GatewayError::InvalidHeader {
                name: name.to_string(),
            })?;
            builder = builder.header(name, value);
        }
        builder = match &request.body {
            Some(RequestBody::Json(v)) => builder.json(v),
            Some(RequestBody::Bytes(b)) => builder.body(b.clone()),
            None => builder,
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }

    async fn send(&self, request: &GatewayRequest) -> Result<Response, GatewayError> {
        tracing::debug!(method = %request.method, url = %request.url, "Sending request");
        let response = self
            .build(request)?
            .send()
            .await
            .map_err(|e| transport_error(&request.method, &request.url, e))?;
        if let Err(e) = self.persist_cookies(&response).await {
            tracing::warn!(error = %e, "Failed to persist cookies");
        }
        Ok(response)
    }

    /// reqwest's jar can't be iterated, so Set-Cookie headers are mirrored
    /// into our own JSON list of `{url, cookie}`.
    async fn persist_cookies(&self, response: &Response) -> Result<()> {
        let headers = response.headers();
        if headers.get("set-cookie").is_none() {
            return Ok(());
        }
        let url_str = response.url().to_string();
        let now = chrono::Utc::now();
        let mut entries = self.cookie_entries.lock().await;
        for cookie_header in headers.get_all("set-cookie") {
            let Ok(val) = cookie_header.to_str() else {
                continue;
            };
            let new_name = cookie_name(val);
            if new_name.is_empty() {
                continue;
            }
            entries.retain(|e| e.url != url_str || cookie_name(&e.cookie) != new_name);
            if is_cookie_expired(val, &now) {
                tracing::debug!(cookie = new_name, "Dropping expired Set-Cookie");
                continue;
            }
            entries.push(CookieEntry {
                url: url_str.clone(),
                cookie: val.to_string(),
            });
        }
        write_private(&self.cookie_path, &serde_json::to_string_pretty(&*entries)?).await
    }

    #[cfg(test)]
    async fn cookie_count(&self) -> usize {
        self.cookie_entries.lock().await.len()
    }
}

async fn load_cookie_entries(path: &Path) -> Vec<CookieEntry> {
    let contents = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read cookie jar");
            return Vec::new();
        }
    };
    let Ok(entries) = serde_json::from_str::<Vec<CookieEntry>>(&contents) else {
        tracing::warn!(path = %path.display(), "Cookie jar corrupt, starting fresh");
        return Vec::new();
    };
    let now = chrono::Utc::now();
    entries
        .into_iter()
        .filter(|e| {
            let expired = is_cookie_expired(&e.cookie, &now);
            if expired {
                tracing::debug!(url = %e.url, "Pruning expired cookie");
            }
            !expired
        })
        .collect()
}

/// Deadline overruns become [`GatewayError::Timeout`] naming the call.
fn transport_error(method: &Method, url: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(format!("{method} {url}"))
    } else {
        GatewayError::Http(e)
    }
}

/// Write a file readable only by the owner; it holds auth material.
pub(crate) async fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

#[async_trait]
impl RequestGateway for HttpGateway {
    async fn execute(&self, request: &GatewayRequest) -> Result<RawResponse, GatewayError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&request.method, &request.url, e))?;
        Ok(RawResponse {
            status,
            headers,
            text,
        })
    }

    async fn execute_stream(
        &self,
        request: &GatewayRequest,
    ) -> Result<StreamResponse, GatewayError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_length = response.content_length();
        let (method, url) = (request.method.clone(), request.url.clone());
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| transport_error(&method, &url, e))
            })
            .boxed();
        Ok(StreamResponse {
            status,
            headers,
            content_length,
            body,
        })
    }
}

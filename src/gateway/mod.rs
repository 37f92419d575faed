//! Request gateway: the single capability every service uses to talk to
//! Apple. The transport sits behind [`RequestGateway`] so the auth machine,
//! the pager and the downloader can be exercised against scripted fakes.
//!
//! [`SessionClient`] layers the session bookkeeping on top: after each call
//! it folds the response headers into the shared session, then maps 410s,
//! vendor error payloads and unexpected statuses to [`GatewayError`].

pub mod http;
pub mod vendor_error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;

use crate::auth::session::{session_patch_from_headers, SharedSession};
pub use self::http::HttpGateway;
pub use self::vendor_error::VendorError;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, GatewayError>>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{method} {url} failed, status {status}: {source}")]
    Vendor {
        method: Method,
        url: String,
        status: u16,
        #[source]
        source: VendorError,
    },

    #[error("{method} {url} failed, expected status {expected:?} but got {status}: {body}")]
    UnexpectedStatus {
        method: Method,
        url: String,
        expected: Vec<u16>,
        status: u16,
        body: String,
    },

    #[error("{url}: resource gone")]
    ResourceGone { url: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Invalid header {name}")]
    InvalidHeader { name: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Transient timeout-class transport failure, worth retrying in place.
    pub fn is_timeout(&self) -> bool {
        match self {
            GatewayError::Timeout(_) => true,
            GatewayError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub fn is_resource_gone(&self) -> bool {
        matches!(self, GatewayError::ResourceGone { .. })
    }

    /// The vendor-reported error carried by this failure, if any.
    pub fn vendor(&self) -> Option<&VendorError> {
        match self {
            GatewayError::Vendor { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Vendor { status, .. } | GatewayError::UnexpectedStatus { status, .. } => {
                Some(*status)
            }
            GatewayError::ResourceGone { .. } => Some(410),
            GatewayError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Bytes(Vec<u8>),
}

/// One outbound call. Built with the chaining helpers below.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Empty means any status is acceptable.
    pub expect_status: Vec<u16>,
    pub timeout: Option<Duration>,
}

impl GatewayRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            expect_status: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append headers, skipping empty values.
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in headers {
            let v = v.into();
            if !v.is_empty() {
                self.headers.push((k.into(), v));
            }
        }
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn queries(mut self, params: &[(String, String)]) -> Self {
        self.query.extend(params.iter().cloned());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn bytes(mut self, body: Vec<u8>) -> Self {
        self.body = Some(RequestBody::Bytes(body));
        self
    }

    pub fn expect(mut self, statuses: &[u16]) -> Self {
        self.expect_status = statuses.to_vec();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[cfg(test)]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A fully-read text response.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub text: String,
}

/// A response whose body is consumed incrementally.
pub struct StreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Raw transport. Implementations must not interpret the body: status and
/// payload checks happen in [`SessionClient`].
#[async_trait]
pub trait RequestGateway: Send + Sync {
    async fn execute(&self, request: &GatewayRequest) -> Result<RawResponse, GatewayError>;

    async fn execute_stream(&self, request: &GatewayRequest)
        -> Result<StreamResponse, GatewayError>;
}

/// Gateway plus the session it keeps up to date. Cheap to clone.
#[derive(Clone)]
pub struct SessionClient {
    gateway: Arc<dyn RequestGateway>,
    session: SharedSession,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient").finish_non_exhaustive()
    }
}

impl SessionClient {
    pub fn new(gateway: Arc<dyn RequestGateway>, session: SharedSession) -> Self {
        Self { gateway, session }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Execute a call and return its body text once every check passed.
    pub async fn request(&self, request: &GatewayRequest) -> Result<String, GatewayError> {
        let response = self.gateway.execute(request).await?;
        self.absorb_headers(&response.headers).await;
        check_text_response(request, response.status, &response.text)?;
        Ok(response.text)
    }

    /// Execute a call and hand back the body as a byte stream.
    pub async fn request_stream(
        &self,
        request: &GatewayRequest,
    ) -> Result<StreamResponse, GatewayError> {
        let response = self.gateway.execute_stream(request).await?;
        self.absorb_headers(&response.headers).await;
        check_status(request, response.status, "")?;
        Ok(response)
    }

    async fn absorb_headers(&self, headers: &HeaderMap) {
        let patch = session_patch_from_headers(headers);
        if !patch.is_empty() {
            self.session.write().await.apply(patch);
        }
    }
}

/// Order: resource-gone, then vendor payload, then the expected status set.
pub fn check_text_response(
    request: &GatewayRequest,
    status: u16,
    text: &str,
) -> Result<(), GatewayError> {
    if status == 410 {
        return Err(GatewayError::ResourceGone {
            url: request.url.clone(),
        });
    }
    if let Some(source) = vendor_error::detect(text.as_bytes()) {
        return Err(GatewayError::Vendor {
            method: request.method.clone(),
            url: request.url.clone(),
            status,
            source,
        });
    }
    check_status(request, status, text)
}

fn check_status(request: &GatewayRequest, status: u16, body: &str) -> Result<(), GatewayError> {
    if status == 410 {
        return Err(GatewayError::ResourceGone {
            url: request.url.clone(),
        });
    }
    if !request.expect_status.is_empty() && !request.expect_status.contains(&status) {
        return Err(GatewayError::UnexpectedStatus {
            method: request.method.clone(),
            url: request.url.clone(),
            expected: request.expect_status.clone(),
            status,
            body: body.to_string(),
        });
    }
    Ok(())
}

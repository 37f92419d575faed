//! iCloud authentication state machine.
//!
//! The flow mirrors the web client: validate the persisted session token,
//! optionally log straight into a one-factor service, otherwise sign in with
//! credentials and complete two-factor verification and session trust.
//! Every call goes through [`SessionClient`], which keeps the session fields
//! current from response headers.

pub mod endpoints;
pub mod error;
pub mod responses;
pub mod session;
pub mod twofa;

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use self::endpoints::Endpoints;
use self::error::AuthError;
pub use self::responses::AccountLoginResponse;
use self::session::SessionStore;
use crate::gateway::{GatewayRequest, SessionClient};

const APPLE_WIDGET_KEY: &str = "d39ba9916b7251055b22c7f910e2ea796ee65e98b2ddecea8f5dde8d9d1a815d";

/// Supplies a secret on demand. The argument is the account name.
pub type TextProvider = Arc<dyn Fn(&str) -> anyhow::Result<String> + Send + Sync>;

/// Account name plus the capabilities that produce its password and 2FA
/// codes. Nothing here is ever written to disk.
#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    password: TextProvider,
    two_fa_code: TextProvider,
}

impl Credentials {
    pub fn new(account: impl Into<String>, password: TextProvider, two_fa_code: TextProvider) -> Self {
        Self {
            account: account.into(),
            password,
            two_fa_code,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Run a provider off the async runtime; providers may block on stdin.
async fn ask(provider: &TextProvider, account: &str) -> Result<String, AuthError> {
    let provider = Arc::clone(provider);
    let account = account.to_string();
    tokio::task::spawn_blocking(move || provider(&account))
        .await
        .map_err(|e| AuthError::Provider(e.to_string()))?
        .map_err(|e| AuthError::Provider(format!("{e:#}")))
}

pub struct AuthSessionMachine {
    client: SessionClient,
    endpoints: Endpoints,
    credentials: Credentials,
    store: Option<SessionStore>,
    password: Option<String>,
    snapshot: Option<AccountLoginResponse>,
}

impl std::fmt::Debug for AuthSessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSessionMachine")
            .field("endpoints", &self.endpoints)
            .field("credentials", &self.credentials)
            .field("snapshot", &self.snapshot.as_ref().map(|_| "<...>"))
            .finish_non_exhaustive()
    }
}

impl AuthSessionMachine {
    pub fn new(client: SessionClient, endpoints: Endpoints, credentials: Credentials) -> Self {
        Self {
            client,
            endpoints,
            credentials,
            store: None,
            password: None,
            snapshot: None,
        }
    }

    /// Persist the session here after every successful authentication.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    pub fn snapshot(&self) -> Option<&AccountLoginResponse> {
        self.snapshot.as_ref()
    }

    /// Root URL of a named webservice (e.g. `ckdatabasews`).
    pub fn webservice_url(&self, name: &str) -> Result<&str, AuthError> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.webservices.get(name))
            .map(|w| w.url.as_str())
            .ok_or_else(|| AuthError::ServiceNotActivated(name.to_string()))
    }

    /// Try every login path in turn; the first success wins. When all of
    /// them fail, their errors come back joined in attempt order.
    pub async fn authenticate(
        &mut self,
        force_refresh: bool,
        service_hint: Option<&str>,
    ) -> Result<(), AuthError> {
        self.ensure_client_id().await;
        let mut errors = Vec::new();

        let has_token = self.client.session().read().await.has_token();
        if has_token && !force_refresh {
            tracing::debug!("Checking session token validity");
            match self.validate_token().await {
                Ok(()) => return self.finish().await,
                Err(e) => {
                    tracing::info!(error = %e, "Invalid session token, attempting brand new login");
                    errors.push(e);
                }
            }
        }

        if let Some(service) = service_hint {
            let eligible = self
                .snapshot
                .as_ref()
                .is_some_and(|s| s.can_launch_with_one_factor(service));
            if eligible {
                tracing::info!(account = %self.credentials.account, service, "Authenticating for service");
                match self.auth_with_credentials_service(service).await {
                    Ok(()) => return self.finish().await,
                    Err(e) => {
                        tracing::info!(error = %e, "Could not log into service, attempting brand new login");
                        errors.push(AuthError::ServiceLogin {
                            service: service.to_string(),
                            source: Box::new(e),
                        });
                    }
                }
            }
        }

        tracing::info!(account = %self.credentials.account, "Authenticating");
        let full = async {
            self.sign_in().await?;
            self.verify_2fa().await
        };
        match full.await {
            Ok(()) => self.finish().await,
            Err(e) => {
                tracing::warn!(error = %e, "Login failed");
                errors.push(e);
                Err(AuthError::LoginFailed(errors))
            }
        }
    }

    /// Log in, starting over while the user keeps mistyping the 2FA code,
    /// for at most `attempts` logins.
    pub async fn authenticate_interactive(&mut self, attempts: u32) -> Result<(), AuthError> {
        let mut attempt = 1;
        loop {
            match self.authenticate(false, None).await {
                Err(e) if e.is_wrong_code() && attempt < attempts => {
                    attempt += 1;
                    tracing::warn!(attempt, attempts, "Verification code rejected, asking again");
                }
                result => return result,
            }
        }
    }

    async fn finish(&self) -> Result<(), AuthError> {
        tracing::info!("Authentication completed successfully");
        if let Some(store) = &self.store {
            let data = self.client.session().read().await.clone();
            store
                .save(&data)
                .await
                .map_err(|e| AuthError::Provider(format!("Failed to persist session: {e:#}")))?;
        }
        Ok(())
    }

    /// Reuse the persisted OAuth client id so Apple sees one stable browser.
    async fn ensure_client_id(&self) -> String {
        let mut session = self.client.session().write().await;
        session
            .client_id
            .get_or_insert_with(|| format!("auth-{}", Uuid::new_v4()))
            .clone()
    }

    async fn password(&mut self) -> Result<String, AuthError> {
        if let Some(p) = &self.password {
            return Ok(p.clone());
        }
        let password = ask(&self.credentials.password, &self.credentials.account).await?;
        self.password = Some(password.clone());
        Ok(password)
    }

    /// Headers for idmsa calls: OAuth widget identity plus the session
    /// continuation values when we have them.
    async fn auth_headers(&self, accept: Option<&str>) -> Vec<(String, String)> {
        let client_id = self.ensure_client_id().await;
        let session = self.client.session().read().await;
        let mut headers = vec![
            (
                "Accept".to_string(),
                accept.unwrap_or("application/json, text/javascript").to_string(),
            ),
            ("Content-Type".into(), "application/json".into()),
            ("X-Apple-OAuth-Client-Id".into(), APPLE_WIDGET_KEY.into()),
            ("X-Apple-OAuth-Client-Type".into(), "firstPartyAuth".into()),
            ("X-Apple-OAuth-Redirect-URI".into(), self.endpoints.home.clone()),
            ("X-Apple-OAuth-Require-Grant-Code".into(), "true".into()),
            ("X-Apple-OAuth-Response-Mode".into(), "web_message".into()),
            ("X-Apple-OAuth-Response-Type".into(), "code".into()),
            ("X-Apple-OAuth-State".into(), client_id),
            ("X-Apple-Widget-Key".into(), APPLE_WIDGET_KEY.into()),
        ];
        if let Some(scnt) = session.scnt.as_deref().filter(|v| !v.is_empty()) {
            headers.push(("scnt".into(), scnt.to_string()));
        }
        if let Some(id) = session.session_id.as_deref().filter(|v| !v.is_empty()) {
            headers.push(("X-Apple-ID-Session-Id".into(), id.to_string()));
        }
        headers
    }

    fn store_snapshot(&mut self, what: &'static str, text: &str) -> Result<(), AuthError> {
        let snapshot: AccountLoginResponse =
            serde_json::from_str(text).map_err(|source| AuthError::Json { what, source })?;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// POST `{setup}/validate` using the current cookies.
    pub async fn validate_token(&mut self) -> Result<(), AuthError> {
        let request = GatewayRequest::post(format!("{}/validate", self.endpoints.setup))
            .json(Value::Null);
        let text = self
            .client
            .request(&request)
            .await
            .map_err(AuthError::InvalidToken)?;
        tracing::debug!("Session token is still valid");
        self.store_snapshot("validate", &text)
    }

    /// One-factor login scoped to a single app, then a token validation.
    pub async fn auth_with_credentials_service(&mut self, service: &str) -> Result<(), AuthError> {
        let password = self.password().await?;
        let request = GatewayRequest::post(format!("{}/accountLogin", self.endpoints.setup)).json(
            json!({
                "appName": service,
                "apple_id": self.credentials.account,
                "password": password,
            }),
        );
        self.client
            .request(&request)
            .await
            .map_err(|source| AuthError::Request {
                what: "service accountLogin",
                source,
            })?;
        self.validate_token().await
    }

    /// Submit credentials to the identity service, then exchange the
    /// resulting session token for a web session.
    pub async fn sign_in(&mut self) -> Result<(), AuthError> {
        let password = self.password().await?;
        let trust_token = self.client.session().read().await.trust_token.clone();
        let trust_tokens: Vec<String> = trust_token.into_iter().filter(|t| !t.is_empty()).collect();
        let body = json!({
            "accountName": self.credentials.account,
            "password": password,
            "rememberMe": true,
            "trustTokens": trust_tokens,
        });
        // 409 means the credentials were accepted and a second factor is pending
        let request = GatewayRequest::post(format!("{}/signin", self.endpoints.auth))
            .headers(self.auth_headers(None).await)
            .query("isRememberMeEnabled", "true")
            .json(body)
            .expect(&[200, 409]);
        self.client
            .request(&request)
            .await
            .map_err(AuthError::CredentialsRejected)?;
        self.auth_with_token().await
    }

    /// POST `{setup}/accountLogin` with the session and trust tokens.
    pub async fn auth_with_token(&mut self) -> Result<(), AuthError> {
        let body = {
            let session = self.client.session().read().await;
            json!({
                "accountCountryCode": session.account_country.clone().unwrap_or_default(),
                "dsWebAuthToken": session.session_token.clone().unwrap_or_default(),
                "extended_login": true,
                "trustToken": session.trust_token.clone().unwrap_or_default(),
            })
        };
        let request = GatewayRequest::post(format!("{}/accountLogin", self.endpoints.setup))
            .json(body)
            .expect(&[200]);
        let text = self
            .client
            .request(&request)
            .await
            .map_err(|source| AuthError::Request {
                what: "accountLogin",
                source,
            })?;
        self.store_snapshot("accountLogin", &text)?;

        // China mainland accounts get redirected to the .com.cn hosts
        if let Some(domain) = self.snapshot.as_ref().and_then(|s| s.domain_to_use.clone()) {
            return Err(AuthError::DomainRedirect(domain));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn credentials(code: &'static str) -> Credentials {
        Credentials::new(
            "user@example.com",
            Arc::new(|_: &str| Ok("hunter2".to_string())),
            Arc::new(move |_: &str| Ok(code.to_string())),
        )
    }
}

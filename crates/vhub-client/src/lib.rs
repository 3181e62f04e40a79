//! REST client for the marketplace backend: session handling, retries and the
//! typed endpoints the browse pages consume.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use vhub_core::{
    FavoriteEntry, Foundation, ItemType, OpaqueRecord, Opportunity, RatingSummary, Session,
    SessionUser,
};

pub const CRATE_NAME: &str = "vhub-client";

pub const DEFAULT_BASE_URL: &str = "http://localhost:3001/api";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Where the login session is kept between runs; `None` keeps it in memory only.
    pub session_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            session_file: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup; unset or unparsable values keep the defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = BackoffPolicy::default();
        let backoff = BackoffPolicy {
            max_retries: number("VHUB_HTTP_RETRIES")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_retries),
            base_delay: number("VHUB_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: number("VHUB_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };

        Self {
            base_url: var("VHUB_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_secs(number("VHUB_HTTP_TIMEOUT_SECS").unwrap_or(20)),
            user_agent: Some(
                var("VHUB_USER_AGENT").unwrap_or_else(|| "vhub-client/0.1".to_string()),
            ),
            backoff,
            session_file: var("VHUB_SESSION_FILE").map(PathBuf::from).or_else(|| {
                var("HOME").map(|home| PathBuf::from(home).join(".vhub").join("session.json"))
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session file {path} is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("session is no longer valid, please log in again")]
    Unauthorized { url: String },
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("unexpected response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Session(#[from] SessionStoreError),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }
}

/// Persistence for the login session.
#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn load(&self) -> Result<Option<Session>, SessionStoreError>;
    async fn save(&self, session: &Session) -> Result<(), SessionStoreError>;
    async fn clear(&self) -> Result<(), SessionStoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new(initial: Option<Session>) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>, SessionStoreError> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        *self.inner.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionStoreError> {
        *self.inner.lock().await = None;
        Ok(())
    }
}

/// JSON session file, replaced atomically through a temp file + rename.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SessionStoreError {
        SessionStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>, SessionStoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| SessionStoreError::Format {
                    path: self.path.clone(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(err)),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        let bytes = serde_json::to_vec_pretty(session).map_err(|source| SessionStoreError::Format {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }

        let temp_path = self
            .path
            .with_file_name(format!(".{}.session.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|err| self.io_error(err))?;

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionStoreError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}

/// Explicit handle on the current login, shared by everything that talks to the
/// backend. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    current: Arc<RwLock<Option<Session>>>,
    store: Arc<dyn SessionStore>,
}

impl SessionContext {
    pub fn new(initial: Option<Session>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
            store,
        }
    }

    pub fn in_memory(initial: Option<Session>) -> Self {
        Self::new(initial.clone(), Arc::new(MemorySessionStore::new(initial)))
    }

    /// Start from whatever the store holds.
    pub async fn restore(store: Arc<dyn SessionStore>) -> Result<Self, SessionStoreError> {
        let initial = store.load().await?;
        Ok(Self::new(initial, store))
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    pub async fn token(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|s| s.token.clone())
    }

    pub async fn user(&self) -> Option<SessionUser> {
        self.current.read().await.as_ref().map(|s| s.user.clone())
    }

    pub async fn is_logged_in(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn set(&self, session: Session) -> Result<(), SessionStoreError> {
        self.store.save(&session).await?;
        *self.current.write().await = Some(session);
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), SessionStoreError> {
        *self.current.write().await = None;
        self.store.clear().await
    }
}

/// The backend operations the page controllers depend on.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn foundations(&self) -> Result<Vec<Foundation>, ApiError>;
    async fn foundation(&self, id: &str) -> Result<Foundation, ApiError>;
    async fn opportunities(&self) -> Result<Vec<Opportunity>, ApiError>;
    async fn active_opportunities(&self) -> Result<Vec<Opportunity>, ApiError>;
    async fn opportunities_by_foundation(
        &self,
        foundation_id: &str,
    ) -> Result<Vec<Opportunity>, ApiError>;
    async fn opportunity(&self, id: &str) -> Result<Opportunity, ApiError>;
    async fn average_rating(&self, opportunity_id: &str) -> Result<RatingSummary, ApiError>;
    async fn opportunity_comments(&self, opportunity_id: &str)
        -> Result<Vec<OpaqueRecord>, ApiError>;
    /// Favorites of the logged-in user.
    async fn favorites(&self) -> Result<Vec<FavoriteEntry>, ApiError>;
    async fn add_favorite(&self, item_id: &str, item_type: ItemType) -> Result<(), ApiError>;
    async fn remove_favorite(&self, item_id: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    user: SessionUser,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    session: SessionContext,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, session: SessionContext) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session,
            backoff: config.backoff,
        })
    }

    /// Client whose session lives in `config.session_file` (or memory when unset).
    pub async fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let session = match &config.session_file {
            Some(path) => SessionContext::restore(Arc::new(FileSessionStore::new(path)))
                .await
                .with_context(|| format!("restoring session from {}", path.display()))?,
            None => SessionContext::in_memory(None),
        };
        Self::new(config, session)
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn current_user_id(&self) -> Result<String, ApiError> {
        self.session
            .user()
            .await
            .map(|u| u.id)
            .ok_or(ApiError::NotLoggedIn)
    }

    /// Drop the login the rejected request was sent with. A session replaced
    /// while the request was in flight is left alone.
    async fn session_expired(&self, url: &str, sent_token: Option<&str>) -> ApiError {
        if self.session.token().await.as_deref() == sent_token {
            if let Err(err) = self.session.clear().await {
                warn!(%err, "failed to clear stored session");
            }
            warn!(url, "backend rejected the session; cleared local login");
        } else {
            debug!(url, "rejected token was already replaced; keeping current login");
        }
        ApiError::Unauthorized {
            url: url.to_string(),
        }
    }

    /// Send one request and return the success body. Only GETs are retried.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<Vec<u8>, ApiError> {
        let span = info_span!("api_call", %method, url);
        async {
            let max_retries = if method == Method::GET {
                self.backoff.max_retries
            } else {
                0
            };
            let token = self.session.token().await;
            let mut attempt = 0;

            loop {
                let mut request = self.client.request(method.clone(), url);
                if let Some(token) = &token {
                    request = request.bearer_auth(token);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }

                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let bytes = resp.bytes().await.map_err(|source| ApiError::Request {
                                url: url.to_string(),
                                source,
                            })?;
                            return Ok(bytes.to_vec());
                        }

                        if status == StatusCode::UNAUTHORIZED {
                            return Err(self.session_expired(url, token.as_deref()).await);
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < max_retries
                        {
                            debug!(status = status.as_u16(), attempt, "retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        let message = error_message(resp).await;
                        return Err(ApiError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                            message,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < max_retries
                        {
                            debug!(%err, attempt, "retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(ApiError::Request {
                            url: url.to_string(),
                            source: err,
                        });
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let bytes = self.execute(Method::GET, &url, None).await?;
        decode(&url, &bytes)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let bytes = self.execute(method, &url, body.as_ref()).await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return decode(&url, b"null");
        }
        decode(&url, &bytes)
    }

    async fn send_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<(), ApiError> {
        let url = self.url(path);
        self.execute(method, &url, body.as_ref()).await?;
        Ok(())
    }

    /// Exchange credentials for a session. Foundation accounts also get their
    /// foundation record attached.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        self.session.clear().await?;
        let body = json!({ "email": email, "password": password });
        let response: LoginResponse =
            match self.send_json(Method::POST, "/auth/login", Some(body)).await {
                Err(ApiError::Unauthorized { .. }) => return Err(ApiError::InvalidCredentials),
                other => other?,
            };

        let mut session = Session {
            token: response.access_token,
            user: response.user,
            foundation: None,
        };
        self.session.set(session.clone()).await?;

        if session.user.is_foundation() {
            match self.foundation_by_user(&session.user.id).await {
                Ok(foundation) => {
                    session.foundation = Some(foundation);
                    self.session.set(session.clone()).await?;
                }
                Err(err) => warn!(%err, user_id = %session.user.id, "no foundation for account"),
            }
        }
        Ok(session)
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.session.clear().await?;
        Ok(())
    }

    pub async fn foundation_by_user(&self, user_id: &str) -> Result<Foundation, ApiError> {
        self.get_json(&format!("/foundations/user/{user_id}")).await
    }

    pub async fn apply_to_opportunity(
        &self,
        opportunity_id: &str,
        message: Option<&str>,
    ) -> Result<OpaqueRecord, ApiError> {
        self.send_json(
            Method::POST,
            &format!("/opportunities/{opportunity_id}/apply"),
            Some(json!({ "message": message.unwrap_or_default() })),
        )
        .await
    }

    pub async fn my_donations(&self) -> Result<Vec<OpaqueRecord>, ApiError> {
        let user_id = self.current_user_id().await?;
        self.get_json(&format!("/donations/user/{user_id}")).await
    }

    pub async fn my_notifications(&self, unread_only: bool) -> Result<Vec<OpaqueRecord>, ApiError> {
        let user_id = self.current_user_id().await?;
        let path = if unread_only {
            format!("/notifications/user/{user_id}/unread")
        } else {
            format!("/notifications/user/{user_id}")
        };
        self.get_json(&path).await
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ApiError> {
        self.send_unit(
            Method::PATCH,
            &format!("/notifications/{notification_id}/read"),
            None,
        )
        .await
    }

    pub async fn my_participations(&self) -> Result<Vec<OpaqueRecord>, ApiError> {
        let user_id = self.current_user_id().await?;
        self.get_json(&format!("/participation-requests/user/{user_id}"))
            .await
    }

    pub async fn create_donation(
        &self,
        foundation_id: &str,
        amount: f64,
    ) -> Result<OpaqueRecord, ApiError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ApiError::InvalidInput {
                field: "amount",
                reason: format!("{amount} is not a positive amount"),
            });
        }
        let user_id = self.current_user_id().await?;
        self.send_json(
            Method::POST,
            "/donations",
            Some(json!({
                "user_id": user_id,
                "foundation_id": foundation_id,
                "amount": amount,
            })),
        )
        .await
    }

    /// Comment on a foundation or an opportunity.
    pub async fn create_comment(
        &self,
        item_type: ItemType,
        item_id: &str,
        text: &str,
    ) -> Result<OpaqueRecord, ApiError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ApiError::InvalidInput {
                field: "comment",
                reason: "text is empty".to_string(),
            });
        }
        let user_id = self.current_user_id().await?;
        let mut body = json!({ "user_id": user_id, "text": text });
        body[target_field(item_type)] = json!(item_id);
        self.send_json(Method::POST, "/comments", Some(body)).await
    }

    /// Rate a foundation or an opportunity from 1 to 5.
    pub async fn create_rating(
        &self,
        item_type: ItemType,
        item_id: &str,
        rating: u8,
    ) -> Result<OpaqueRecord, ApiError> {
        if !(1..=5).contains(&rating) {
            return Err(ApiError::InvalidInput {
                field: "rating",
                reason: format!("{rating} is outside 1..=5"),
            });
        }
        let user_id = self.current_user_id().await?;
        let mut body = json!({ "user_id": user_id, "rating": rating });
        body[target_field(item_type)] = json!(item_id);
        self.send_json(Method::POST, "/ratings", Some(body)).await
    }

    pub async fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        let user_id = self.current_user_id().await?;
        self.send_unit(
            Method::POST,
            &format!("/notifications/user/{user_id}/mark-all-read"),
            None,
        )
        .await
    }
}

#[async_trait]
impl MarketplaceApi for ApiClient {
    async fn foundations(&self) -> Result<Vec<Foundation>, ApiError> {
        self.get_json("/foundations").await
    }

    async fn foundation(&self, id: &str) -> Result<Foundation, ApiError> {
        self.get_json(&format!("/foundations/{id}")).await
    }

    async fn opportunities(&self) -> Result<Vec<Opportunity>, ApiError> {
        self.get_json("/opportunities").await
    }

    async fn active_opportunities(&self) -> Result<Vec<Opportunity>, ApiError> {
        self.get_json("/opportunities/active").await
    }

    async fn opportunities_by_foundation(
        &self,
        foundation_id: &str,
    ) -> Result<Vec<Opportunity>, ApiError> {
        self.get_json(&format!("/opportunities/foundation/{foundation_id}"))
            .await
    }

    async fn opportunity(&self, id: &str) -> Result<Opportunity, ApiError> {
        self.get_json(&format!("/opportunities/{id}")).await
    }

    async fn average_rating(&self, opportunity_id: &str) -> Result<RatingSummary, ApiError> {
        self.get_json(&format!("/ratings/opportunity/{opportunity_id}/average"))
            .await
    }

    async fn opportunity_comments(
        &self,
        opportunity_id: &str,
    ) -> Result<Vec<OpaqueRecord>, ApiError> {
        self.get_json(&format!("/comments/opportunity/{opportunity_id}"))
            .await
    }

    async fn favorites(&self) -> Result<Vec<FavoriteEntry>, ApiError> {
        let user_id = self.current_user_id().await?;
        self.get_json(&format!("/users/{user_id}/favorites")).await
    }

    async fn add_favorite(&self, item_id: &str, item_type: ItemType) -> Result<(), ApiError> {
        let user_id = self.current_user_id().await?;
        self.send_unit(
            Method::POST,
            &format!("/users/{user_id}/favorites"),
            Some(json!({ "item_id": item_id, "item_type": item_type })),
        )
        .await
    }

    async fn remove_favorite(&self, item_id: &str) -> Result<(), ApiError> {
        let user_id = self.current_user_id().await?;
        self.send_unit(
            Method::DELETE,
            &format!("/users/{user_id}/favorites/{item_id}"),
            None,
        )
        .await
    }
}

/// Backend key naming the target of a comment or rating; opportunities are
/// social actions on the wire.
fn target_field(item_type: ItemType) -> &'static str {
    match item_type {
        ItemType::Foundation => "foundation_id",
        ItemType::Opportunity => "social_action_id",
    }
}

fn decode<T: DeserializeOwned>(url: &str, bytes: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}

/// Backend error text from a JSON `message` field, or a generic status line.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    resp.json::<JsonValue>()
        .await
        .ok()
        .and_then(|v| v.get("message").and_then(JsonValue::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("request failed with status {}", status.as_u16()))
}

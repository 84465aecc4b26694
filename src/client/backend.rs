//! HTTP client for the backend-as-a-service surface.
//!
//! One [`BackendClient`] holds the base URL, the anon key and the current
//! session. It is cheap to clone; clones share the session.

use std::fmt;
use std::sync::Arc;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use url::Url;

use super::realtime::{self, RealtimeChannel};
use crate::config::Config;
use crate::errors::{AppError, ErrorResponse};
use crate::models::{AuthUser, AuthUserUpdate, PasswordCredentials, Session, SignUpRequest};
use crate::query::{Direction, Filter, Nulls, Operator, Order, RowQuery};

/// Conflict handling for upserts, sent as the `Prefer` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    IgnoreDuplicates,
    MergeDuplicates,
}

impl ConflictMode {
    fn prefer(&self) -> &'static str {
        match self {
            ConflictMode::IgnoreDuplicates => "resolution=ignore-duplicates",
            ConflictMode::MergeDuplicates => "resolution=merge-duplicates",
        }
    }
}

/// Client for the REST, RPC, auth and realtime endpoints.
#[derive(Clone)]
pub struct BackendClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    base_url: Url,
    anon_key: String,
    session: RwLock<Option<Session>>,
    session_tx: watch::Sender<Option<AuthUser>>,
}

impl BackendClient {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, AppError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let (session_tx, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                base_url,
                anon_key: anon_key.into(),
                session: RwLock::new(None),
                session_tx,
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Self::new(&config.backend_url, config.anon_key.clone())
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.session.read().await.clone()
    }

    pub async fn current_user(&self) -> Option<AuthUser> {
        self.inner.session.read().await.as_ref().map(|s| s.user.clone())
    }

    /// The signed-in user, or `Unauthorized`.
    pub async fn require_user(&self) -> Result<AuthUser, AppError> {
        self.current_user()
            .await
            .ok_or_else(|| AppError::Unauthorized("Not signed in".to_string()))
    }

    /// Observe sign-in and sign-out.
    pub fn session_changes(&self) -> watch::Receiver<Option<AuthUser>> {
        self.inner.session_tx.subscribe()
    }

    /// Adopt a session persisted by an earlier run.
    pub async fn restore_session(&self, session: Session) {
        self.set_session(Some(session)).await;
    }

    async fn set_session(&self, session: Option<Session>) {
        let user = session.as_ref().map(|s| s.user.clone());
        *self.inner.session.write().await = session;
        self.inner.session_tx.send_replace(user);
    }

    /// Access token of the session, or the anon key.
    async fn bearer(&self) -> String {
        match self.inner.session.read().await.as_ref() {
            Some(session) => session.access_token.clone(),
            None => self.inner.anon_key.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        Ok(self.inner.base_url.join(path)?)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, AppError> {
        let url = self.endpoint(path)?;
        Ok(self
            .inner
            .http
            .request(method, url)
            .header("apikey", &self.inner.anon_key)
            .bearer_auth(self.bearer().await))
    }

    /// Send and decode a JSON body, mapping error envelopes back to [`AppError`].
    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, AppError> {
        let response = check(builder.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    /// Select, insert, update or delete rows of one table.
    pub fn from(&self, table: &str) -> TableQuery {
        TableQuery {
            client: self.clone(),
            table: table.to_string(),
            query: RowQuery::default(),
        }
    }

    /// Call a stored procedure.
    pub async fn rpc<A, T>(&self, name: &str, args: &A) -> Result<T, AppError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self
            .request(Method::POST, &format!("rest/v1/rpc/{}", name))
            .await?
            .json(args);
        self.send(builder).await
    }

    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<Session, AppError> {
        let builder = self
            .request(Method::POST, "auth/v1/signup")
            .await?
            .json(request);
        let session: Session = self.send(builder).await?;
        self.set_session(Some(session.clone())).await;
        tracing::info!("Signed up as {}", session.user.id);
        Ok(session)
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AppError> {
        let credentials = PasswordCredentials {
            email: email.to_string(),
            password: password.to_string(),
        };
        let builder = self
            .request(Method::POST, "auth/v1/token")
            .await?
            .query(&[("grant_type", "password")])
            .json(&credentials);
        let session: Session = self.send(builder).await?;
        self.set_session(Some(session.clone())).await;
        tracing::info!("Signed in as {}", session.user.id);
        Ok(session)
    }

    /// End the session. The local session is cleared even if the server call fails.
    pub async fn sign_out(&self) -> Result<(), AppError> {
        if self.inner.session.read().await.is_none() {
            return Ok(());
        }
        let result = match self.request(Method::POST, "auth/v1/logout").await {
            Ok(builder) => match builder.send().await {
                Ok(response) => check(response).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        self.set_session(None).await;
        tracing::info!("Signed out");
        result
    }

    pub async fn get_user(&self) -> Result<AuthUser, AppError> {
        let builder = self.request(Method::GET, "auth/v1/user").await?;
        self.send(builder).await
    }

    pub async fn update_user(&self, update: &AuthUserUpdate) -> Result<AuthUser, AppError> {
        let builder = self
            .request(Method::PUT, "auth/v1/user")
            .await?
            .json(update);
        self.send(builder).await
    }

    /// Open a realtime channel on inserts into `table`, optionally filtered.
    pub async fn subscribe(
        &self,
        topic: &str,
        table: &str,
        filter: Option<&Filter>,
    ) -> Result<RealtimeChannel, AppError> {
        let mut url = self.endpoint("realtime/v1/websocket")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| AppError::BadRequest(format!("Cannot open a websocket to {}", url)))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.inner.anon_key)
            .append_pair("token", &self.bearer().await);

        realtime::connect(url, topic, table, filter.map(|f| f.to_string())).await
    }
}

/// Pass successful responses through; decode failures into [`AppError`].
async fn check(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(envelope) => Err(envelope.into_error()),
        Err(_) => Err(match status.as_u16() {
            401 | 403 => AppError::Unauthorized(format!("HTTP {}", status)),
            404 => AppError::NotFound(format!("HTTP {}", status)),
            _ => AppError::Network(format!("HTTP {}: {}", status, body)),
        }),
    }
}

/// A pending table request built up from filters and modifiers.
pub struct TableQuery {
    client: BackendClient,
    table: String,
    query: RowQuery,
}

impl TableQuery {
    /// Only return these columns.
    pub fn select(mut self, columns: &[&str]) -> Self {
        self.query.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.query.filters.push(filter);
        self
    }

    pub fn eq(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(Filter::new(column, Operator::Eq, value))
    }

    pub fn neq(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(Filter::new(column, Operator::Neq, value))
    }

    pub fn gt(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(Filter::new(column, Operator::Gt, value))
    }

    pub fn gte(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(Filter::new(column, Operator::Gte, value))
    }

    pub fn lt(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(Filter::new(column, Operator::Lt, value))
    }

    pub fn lte(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(Filter::new(column, Operator::Lte, value))
    }

    /// Case-insensitive pattern; `*` is the wildcard.
    pub fn ilike(self, column: &str, pattern: impl fmt::Display) -> Self {
        self.filter(Filter::new(column, Operator::Ilike, pattern))
    }

    pub fn is_null(self, column: &str) -> Self {
        self.filter(Filter::is_null(column))
    }

    pub fn is_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        self.filter(Filter::is_in(column, values))
    }

    pub fn order(mut self, column: &str, direction: Direction) -> Self {
        self.query.order.push(Order {
            column: column.to_string(),
            direction,
            nulls: None,
        });
        self
    }

    pub fn order_nulls(mut self, column: &str, direction: Direction, nulls: Nulls) -> Self {
        self.query.order.push(Order {
            column: column.to_string(),
            direction,
            nulls: Some(nulls),
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.query.offset = Some(offset);
        self
    }

    fn path(&self) -> String {
        format!("rest/v1/{}", self.table)
    }

    async fn builder(&self, method: Method) -> Result<RequestBuilder, AppError> {
        Ok(self
            .client
            .request(method, &self.path())
            .await?
            .query(&self.query.to_pairs()))
    }

    pub async fn fetch<T: DeserializeOwned>(self) -> Result<Vec<T>, AppError> {
        let builder = self.builder(Method::GET).await?;
        self.client.send(builder).await
    }

    /// At most one row.
    pub async fn fetch_optional<T: DeserializeOwned>(self) -> Result<Option<T>, AppError> {
        let rows: Vec<T> = self.limit(1).fetch().await?;
        Ok(rows.into_iter().next())
    }

    pub async fn insert<B, T>(self, body: &B) -> Result<Vec<T>, AppError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self.builder(Method::POST).await?.json(body);
        self.client.send(builder).await
    }

    /// Insert, resolving unique conflicts on `on_conflict` as `mode` says.
    pub async fn upsert<B, T>(
        mut self,
        body: &B,
        on_conflict: &[&str],
        mode: ConflictMode,
    ) -> Result<Vec<T>, AppError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if !on_conflict.is_empty() {
            self.query.on_conflict = Some(on_conflict.iter().map(|c| c.to_string()).collect());
        }
        let builder = self
            .builder(Method::POST)
            .await?
            .header("Prefer", mode.prefer())
            .json(body);
        self.client.send(builder).await
    }

    pub async fn update<B, T>(self, changes: &B) -> Result<Vec<T>, AppError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self.builder(Method::PATCH).await?.json(changes);
        self.client.send(builder).await
    }

    pub async fn delete<T: DeserializeOwned>(self) -> Result<Vec<T>, AppError> {
        let builder = self.builder(Method::DELETE).await?;
        self.client.send(builder).await
    }
}

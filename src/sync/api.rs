//! Remote Store Client - HTTP access to the document database
//!
//! The rest of the crate only sees the [`RemoteStore`] trait:
//! - create / update / delete of entities in a collection (ids are chosen
//!   by the client, so a create is a PUT to the entity's own path)
//! - paged listing for the article feed
//!
//! [`HttpRemoteStore`] is the REST implementation. Every write carries an
//! `Idempotency-Key` so replays of a delivered-but-unacknowledged write are
//! deduplicated server-side.

use super::models::{Fields, Mutation, RemoteAck};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Page request for listing a collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    pub limit: usize,
    /// Opaque cursor returned by the previous page
    pub cursor: Option<String>,
}

/// One page of raw entities
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EntityPage {
    pub items: Vec<Value>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Operations consumed from the remote document database
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create an entity under a client-chosen id
    async fn create_entity(
        &self,
        collection: &str,
        id: &str,
        data: &Fields,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;

    async fn update_entity(
        &self,
        collection: &str,
        id: &str,
        partial: &Fields,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;

    async fn delete_entity(
        &self,
        collection: &str,
        id: &str,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;

    async fn list_entities(
        &self,
        collection: &str,
        page: &PageRequest,
    ) -> Result<EntityPage, RemoteError>;
}

/// Apply one mutation against the remote store
///
/// Deleting an entity that is already gone counts as success so that a
/// replayed delete is harmless.
pub async fn dispatch(
    remote: &dyn RemoteStore,
    mutation: &Mutation,
    idempotency_key: &str,
) -> Result<RemoteAck, RemoteError> {
    let action = mutation.action();
    let collection = mutation.collection();

    let entity_id = match mutation {
        Mutation::CreateArticle { id, data } => {
            remote
                .create_entity(collection, id, data, idempotency_key)
                .await?;
            id.clone()
        }
        Mutation::UpdateArticle { id, changes } => {
            remote
                .update_entity(collection, id, changes, idempotency_key)
                .await?;
            id.clone()
        }
        Mutation::DeleteArticle { id } => {
            match remote.delete_entity(collection, id, idempotency_key).await {
                Ok(()) => {}
                Err(RemoteError::NotFound(_)) => {
                    log::info!("{} {} already deleted remotely", collection, id);
                }
                Err(e) => return Err(e),
            }
            id.clone()
        }
        Mutation::UpdateProfile { uid, changes } => {
            remote
                .update_entity(collection, uid, changes, idempotency_key)
                .await?;
            uid.clone()
        }
    };

    Ok(RemoteAck { action, entity_id })
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// REST client for the document database
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpRemoteStore {
    /// Create a client with the default timeout
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        Self::try_new(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn try_new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url =
            Url::parse(base_url).map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set access token (after sign-in)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (sign-out)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    fn entity_url(&self, collection: &str, id: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty().push("collections").push(collection);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.get_token().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        self.authorize(request)
            .await
            .send()
            .await
            .map_err(classify_transport_error)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create_entity(
        &self,
        collection: &str,
        id: &str,
        data: &Fields,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let url = self.entity_url(collection, Some(id))?;
        let request = self
            .client
            .put(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(data);

        let response = self.send(request).await?;
        handle_empty(response).await?;

        log::debug!("Created {}/{}", collection, id);
        Ok(())
    }

    async fn update_entity(
        &self,
        collection: &str,
        id: &str,
        partial: &Fields,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let url = self.entity_url(collection, Some(id))?;
        let request = self
            .client
            .patch(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(partial);

        let response = self.send(request).await?;
        handle_empty(response).await
    }

    async fn delete_entity(
        &self,
        collection: &str,
        id: &str,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let url = self.entity_url(collection, Some(id))?;
        let request = self
            .client
            .delete(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key);

        let response = self.send(request).await?;
        handle_empty(response).await
    }

    async fn list_entities(
        &self,
        collection: &str,
        page: &PageRequest,
    ) -> Result<EntityPage, RemoteError> {
        let mut url = self.entity_url(collection, None)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &page.limit.to_string());
            if let Some(cursor) = &page.cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let response = self.send(self.client.get(url)).await?;
        handle_response(response).await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unauthorized - sign-in required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    /// Whether replaying the same request later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::RateLimited | Self::Server(_)
        )
    }
}

fn classify_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        RemoteError::Network(err.to_string())
    } else {
        RemoteError::Request(err)
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|_| RemoteError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

async fn handle_empty(response: reqwest::Response) -> Result<(), RemoteError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let msg = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or_else(|_| if body.is_empty() { status.to_string() } else { body });

    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::FORBIDDEN => RemoteError::Forbidden(msg),
        StatusCode::NOT_FOUND => RemoteError::NotFound(msg),
        StatusCode::CONFLICT => RemoteError::Conflict(msg),
        StatusCode::REQUEST_TIMEOUT => RemoteError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
        s if s.is_server_error() => RemoteError::Server(format!("{}: {}", s, msg)),
        _ => RemoteError::Validation(format!("{}: {}", status, msg)),
    }
}

// ============================================================================
// Tests
// ============================================================================

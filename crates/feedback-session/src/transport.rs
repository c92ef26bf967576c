//! Authorization-aware HTTP transport.
//!
//! Every request goes through [`TransportGuard::send`], which attaches the
//! stored bearer credential and watches for authorization failures. A `401`
//! clears the stored credential and publishes [`EventKind::UNAUTHORIZED`],
//! then the failure is returned to the caller like any other error.

use crate::error::{ApiError, ApiResult};
use crate::events::{EventBus, EventKind};
use crate::protocol::error_message;
use crate::storage::{ACCESS_TOKEN_KEY, StorageAdapter};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether a response status means the credential was not accepted.
pub fn is_unauthorized(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED
}

pub struct TransportGuard {
    http: reqwest::Client,
    base_url: String,
    storage: Arc<StorageAdapter>,
    bus: Arc<EventBus>,
}

impl TransportGuard {
    pub fn new(
        base_url: impl Into<String>,
        storage: Arc<StorageAdapter>,
        bus: Arc<EventBus>,
    ) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("feedback/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http, base_url, storage, bus))
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        storage: Arc<StorageAdapter>,
        bus: Arc<EventBus>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            storage,
            bus,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request for `path` (which must begin with `/`).
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{path}", self.base_url))
    }

    /// Send with the current credential attached and classify the response.
    pub async fn send(&self, builder: RequestBuilder) -> ApiResult<Response> {
        let builder = match self.storage.get(ACCESS_TOKEN_KEY) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        let request = builder.build()?;
        let method = request.method().clone();
        let path = request.url().path().to_string();

        let started = Instant::now();
        let response = self.http.execute(request).await.map_err(|e| {
            tracing::debug!(%method, %path, error = %e, "request failed");
            ApiError::from(e)
        })?;
        let status = response.status();
        tracing::debug!(
            %method,
            %path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );

        if status.is_success() {
            return Ok(response);
        }

        let fallback = status.canonical_reason().unwrap_or("request failed");
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body, fallback);

        if is_unauthorized(status) {
            tracing::warn!(%path, "credential rejected, clearing session");
            self.storage.remove(ACCESS_TOKEN_KEY);
            self.bus.publish(&EventKind::UNAUTHORIZED);
            return Err(ApiError::Unauthorized { message });
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// [`send`](Self::send) and decode a JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let response = self.send(builder).await?;
        response.json().await.map_err(|e| ApiError::Decode {
            message: e.to_string(),
        })
    }
}

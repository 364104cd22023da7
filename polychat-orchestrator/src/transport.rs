//! # Transport
//!
//! The [`CompletionTransport`] seam and its `reqwest` implementation,
//! [`HttpClient`], which also serves the generation lookup and image
//! downloads.

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde_json::Value;
use shared::config::ApiConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    composer::CompletionRequest,
    cost::{GenerationUsage, UsageLookup},
    errors::{OrchestratorError, OrchestratorResult},
    images::{FetchedImage, ImageFetcher},
};

/// Raw body chunks of a streaming completion.
pub type ByteStream = BoxStream<'static, OrchestratorResult<Vec<u8>>>;

/// Completion endpoint seam.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Opens a streaming completion. The body ends early once `cancel` fires.
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> OrchestratorResult<ByteStream>;

    /// Runs a single-shot completion and returns the JSON body.
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> OrchestratorResult<Value>;
}

#[derive(Debug, Deserialize)]
struct GenerationEnvelope {
    data: GenerationUsage,
}

/// `reqwest` client for `OpenAI`-compatible endpoints.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    image_timeout: Duration,
}

impl HttpClient {
    /// Builds a client for `api`.
    ///
    /// # Errors
    /// Fails when the underlying `reqwest` client cannot be built.
    pub fn new(api: &ApiConfig) -> OrchestratorResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("polychat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| OrchestratorError::Config(err.to_string()))?;

        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
            request_timeout: api.request_timeout(),
            image_timeout: api.image_fetch_timeout(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder, cancel: &CancellationToken) -> OrchestratorResult<Response> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            response = builder.send() => response?,
        };
        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> OrchestratorResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(OrchestratorError::Status {
        status: status.as_u16(),
        body: error_body_message(&body),
    })
}

/// Pulls `error.message` out of a JSON error body, falling back to the raw text.
fn error_body_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl CompletionTransport for HttpClient {
    #[instrument(skip(self, request, cancel), fields(model = %request.model))]
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> OrchestratorResult<ByteStream> {
        let payload = request.clone().with_stream(true);
        let builder = self
            .authorized(self.client.post(self.endpoint("chat/completions")))
            .header(header::ACCEPT, "text/event-stream")
            .json(&payload);

        let response = Self::send(builder, &cancel).await?;
        debug!(status = %response.status(), "completion stream opened");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(OrchestratorError::from))
            .take_until(cancel.cancelled_owned());
        Ok(body.boxed())
    }

    #[instrument(skip(self, request, cancel), fields(model = %request.model))]
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> OrchestratorResult<Value> {
        let payload = request.clone().with_stream(false);
        let builder = self
            .authorized(self.client.post(self.endpoint("chat/completions")))
            .timeout(self.request_timeout)
            .json(&payload);

        let response = Self::send(builder, &cancel).await?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            body = response.json::<Value>() => Ok(body?),
        }
    }
}

#[async_trait]
impl UsageLookup for HttpClient {
    async fn lookup(&self, request_id: &str) -> OrchestratorResult<Option<GenerationUsage>> {
        let response = self
            .authorized(self.client.get(self.endpoint("generation")))
            .query(&[("id", request_id)])
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: GenerationEnvelope = ensure_success(response).await?.json().await?;
        Ok(Some(envelope.data))
    }
}

#[async_trait]
impl ImageFetcher for HttpClient {
    async fn fetch(&self, url: &str) -> OrchestratorResult<FetchedImage> {
        let response = self
            .client
            .get(url)
            .timeout(self.image_timeout)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let mime_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = response.bytes().await?.to_vec();

        Ok(FetchedImage { bytes, mime_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_prefers_provider_message() {
        assert_eq!(
            error_body_message(r#"{"error": {"message": "No credits", "code": 402}}"#),
            "No credits"
        );
        assert_eq!(error_body_message(" upstream down \n"), "upstream down");
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let api = ApiConfig {
            base_url: "http://localhost:1234/v1/".into(),
            ..ApiConfig::default()
        };
        let client = HttpClient::new(&api).unwrap();

        assert_eq!(client.endpoint("chat/completions"), "http://localhost:1234/v1/chat/completions");
    }
}

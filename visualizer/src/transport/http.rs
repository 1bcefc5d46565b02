use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use reqwest::StatusCode;
use shared_types::{ProxyErrorBody, RunAck, RunRequest, TraceSnapshot};

use super::{RunSubmission, SnapshotSource, StreamDrain};
use crate::error::TransportError;

/// Talks to one workflow's proxy routes under `base_url`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

async fn status_error(response: reqwest::Response) -> TransportError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ProxyErrorBody>(&body) {
        Ok(ProxyErrorBody {
            error,
            details: Some(details),
        }) => format!("{error}: {details}"),
        Ok(ProxyErrorBody { error, .. }) => error,
        Err(_) if body.is_empty() => "empty response body".to_string(),
        Err(_) => body,
    };
    TransportError::Status { status, message }
}

#[async_trait(?Send)]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_latest(&self) -> Result<Option<TraceSnapshot>, TransportError> {
        let response = self
            .client
            .get(format!("{}/latest", self.base_url))
            .header(CACHE_CONTROL, "no-cache, no-store")
            .header(PRAGMA, "no-cache")
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice::<Option<TraceSnapshot>>(&body)?)
    }

    async fn submit_run(&self, request: &RunRequest) -> Result<RunSubmission, TransportError> {
        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .header(ACCEPT, "application/json, text/event-stream")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        if is_stream {
            let drain = async move {
                let mut body = response.bytes_stream();
                let mut bytes = 0usize;
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(chunk) => bytes += chunk.len(),
                        Err(e) => {
                            tracing::debug!(error = %e, "Run stream closed early");
                            break;
                        }
                    }
                }
                bytes
            };
            return Ok(RunSubmission::Streaming(StreamDrain::new(drain)));
        }

        let body = response.bytes().await?;
        let ack = serde_json::from_slice::<RunAck>(&body).ok();
        Ok(RunSubmission::Ack(ack))
    }
}

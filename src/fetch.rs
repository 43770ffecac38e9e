use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, Url};

use crate::config::FetchSettings;
use crate::error::PipelineError;

/// Upstream error bodies are cut to this many characters before they reach
/// a client.
const MAX_ERROR_DETAIL: usize = 200;

/// Pulls a remote FASTA payload. Implementations own timeouts and retries;
/// the pipeline only sees the bytes or a [`PipelineError::Fetch`] /
/// [`PipelineError::FetchStatus`].
pub trait FastaFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<Vec<u8>, PipelineError>> + Send;
}

#[derive(Clone)]
pub struct HttpFastaFetcher {
    client: Client,
    max_retries: usize,
    max_body_bytes: usize,
}

impl HttpFastaFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("biopipeline/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::Fetch(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| PipelineError::Fetch(err.to_string()))?;

        Ok(Self {
            client,
            max_retries: settings.max_retries,
            max_body_bytes: settings.max_body_bytes,
        })
    }

    async fn send_with_retries<F>(&self, make_req: F) -> Result<Response, PipelineError>
    where
        F: Fn() -> RequestBuilder,
    {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.max_retries && is_retryable_status(status) {
                        tracing::debug!(status, attempt, "retrying remote fetch");
                        backoff(BASE_DELAY_MS, attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.max_retries && is_retryable_error(&err) {
                        tracing::debug!(error = %err, attempt, "retrying remote fetch");
                        backoff(BASE_DELAY_MS, attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PipelineError::Fetch(err.to_string()));
                }
            }
        }
    }

    async fn handle_status(response: Response) -> Result<Response, PipelineError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.trim().chars().take(MAX_ERROR_DETAIL).collect();
        let message = if snippet.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("remote request failed")
                .to_string()
        } else {
            snippet
        };
        Err(PipelineError::FetchStatus {
            status: status.as_u16(),
            message,
        })
    }

    async fn read_capped(&self, mut response: Response) -> Result<Vec<u8>, PipelineError> {
        let limit = self.max_body_bytes;
        if let Some(declared) = response.content_length()
            && declared > limit as u64
        {
            return Err(too_large(limit));
        }
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| PipelineError::Fetch(err.to_string()))?
        {
            if body.len() + chunk.len() > limit {
                return Err(too_large(limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

impl FastaFetcher for HttpFastaFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, PipelineError> {
        let started = std::time::Instant::now();
        let response = self
            .send_with_retries(|| self.client.get(url.clone()))
            .await?;
        let response = Self::handle_status(response).await?;
        let bytes = self.read_capped(response).await?;
        tracing::info!(
            url = %url,
            bytes = bytes.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "remote FASTA downloaded"
        );
        Ok(bytes)
    }
}

fn too_large(limit: usize) -> PipelineError {
    PipelineError::TooLarge(format!("remote file exceeds {limit} bytes"))
}

async fn backoff(base_ms: u64, attempt: usize) {
    tokio::time::sleep(Duration::from_millis(base_ms * (attempt as u64 + 1))).await;
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

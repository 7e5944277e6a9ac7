//! HTTP embedding backends.
//!
//! Both backends share one retry loop:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → `validation`, no retry
//! - transport timeout → `timeout`, retried
//! - connection error → `network`, retried
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;
use rag_harness_core::{RagError, RagResult};

use super::EmbeddingBackend;

/// Shared HTTP plumbing for the concrete backends.
struct HttpBackend {
    client: reqwest::Client,
    max_retries: u32,
    backoff_unit: Duration,
}

impl HttpBackend {
    fn new(timeout: Duration, max_retries: u32) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::unexpected(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_retries,
            backoff_unit: Duration::from_secs(1),
        })
    }

    async fn post_json(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> RagResult<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_unit * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(url).json(body);
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<serde_json::Value>().await.map_err(|e| {
                            RagError::Network(format!("{} returned an unreadable body: {}", label, e))
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 {
                        last_err = Some(RagError::RateLimited(format!("{} {}: {}", label, status, body_text)));
                        continue;
                    }
                    if status.is_server_error() {
                        last_err = Some(RagError::Network(format!("{} error {}: {}", label, status, body_text)));
                        continue;
                    }

                    return Err(RagError::validation(format!(
                        "{} rejected the request {}: {}",
                        label, status, body_text
                    )));
                }
                Err(e) => {
                    tracing::debug!(backend = label, attempt, error = %e, "embedding request failed");
                    last_err = Some(classify_transport(label, url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| RagError::Network(format!("{} failed after retries", label))))
    }
}

fn classify_transport(label: &str, url: &str, e: reqwest::Error) -> RagError {
    if e.is_timeout() {
        RagError::Timeout(format!("{} at {}: {}", label, url, e))
    } else {
        RagError::Network(format!("{} connection error (is it running at {}?): {}", label, url, e))
    }
}

// ============ Ollama ============

/// Calls `POST /api/embed` on a local Ollama instance.
pub struct OllamaBackend {
    http: HttpBackend,
    url: String,
}

impl OllamaBackend {
    pub fn new(url: impl Into<String>, timeout: Duration, max_retries: u32) -> RagResult<Self> {
        Ok(Self {
            http: HttpBackend::new(timeout, max_retries)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn embed_batch(&self, model_id: &str, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": model_id,
            "input": texts,
        });
        let json = self
            .http
            .post_json("Ollama", &format!("{}/api/embed", self.url), None, &body)
            .await?;
        parse_ollama_response(&json)
    }
}

pub fn parse_ollama_response(json: &serde_json::Value) -> RagResult<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| RagError::Network("invalid Ollama response: missing embeddings array".into()))?;

    embeddings.iter().map(parse_vector).collect()
}

// ============ OpenAI ============

/// Calls `POST /v1/embeddings` on the OpenAI API (or a compatible server).
pub struct OpenAiBackend {
    http: HttpBackend,
    url: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> RagResult<Self> {
        Ok(Self {
            http: HttpBackend::new(timeout, max_retries)?,
            url: url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn embed_batch(&self, model_id: &str, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": model_id,
            "input": texts,
        });
        let json = self
            .http
            .post_json(
                "OpenAI",
                &format!("{}/v1/embeddings", self.url),
                Some(&self.api_key),
                &body,
            )
            .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
pub fn parse_openai_response(json: &serde_json::Value) -> RagResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::Network("invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RagError::Network("invalid OpenAI response: missing embedding".into()))?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(value: &serde_json::Value) -> RagResult<Vec<f32>> {
    let arr = value
        .as_array()
        .ok_or_else(|| RagError::Network("invalid embedding: not an array".into()))?;
    arr.iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::Network("invalid embedding: non-numeric component".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_harness_core::ErrorKind;

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let out = parse_ollama_response(&json).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_openai_reorders_by_index() {
        let json = serde_json::json!({"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]}
        ]});
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_malformed_is_backend_failure() {
        let err = parse_ollama_response(&serde_json::json!({"oops": 1})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        let err = parse_ollama_response(&serde_json::json!({"embeddings": [["x"]]})).unwrap_err();
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let backend = OllamaBackend::new("http://127.0.0.1:9", Duration::from_secs(2), 0).unwrap();
        let err = backend
            .embed_batch("nomic-embed-text", &["hi".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Network | ErrorKind::Timeout));
    }
}

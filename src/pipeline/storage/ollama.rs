use serde::{Deserialize, Serialize};

use super::types::EmbeddingModel;
use super::ModelError;

/// Embedding model served by a local Ollama instance (`/api/embed`).
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    dimension: usize,
}

/// Request body for Ollama /api/embed
#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

/// Response body from Ollama /api/embed
#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    /// Connect and probe the model's output width with one request.
    pub fn connect(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, ModelError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ModelError::Init(format!("Failed to create HTTP client: {e}")))?;

        let mut embedder = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
            dimension: 0,
        };

        let probe = embedder.request(&["dimension probe"])?;
        embedder.dimension = probe
            .first()
            .map(Vec::len)
            .filter(|d| *d > 0)
            .ok_or_else(|| ModelError::Response("probe returned no embedding".into()))?;

        tracing::info!(
            base_url = %embedder.base_url,
            model = %embedder.model,
            dimension = embedder.dimension,
            "Ollama embedder connected"
        );
        Ok(embedder)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                ModelError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                ModelError::Timeout(self.timeout_secs)
            } else {
                ModelError::Inference(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbedResponse = response
            .json()
            .map_err(|e| ModelError::Response(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(ModelError::Response(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}

impl EmbeddingModel for OllamaEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::resilience::{Classify, ErrorKind};

    #[test]
    fn request_body_shape() {
        let texts = ["first", "second"];
        let body = EmbedRequest {
            model: "nomic-embed-text",
            input: &texts,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"model": "nomic-embed-text", "input": ["first", "second"]})
        );
    }

    #[test]
    fn response_parses_embeddings() {
        let parsed: EmbedResponse =
            serde_json::from_str(r#"{"model":"m","embeddings":[[0.1,0.2],[0.3,0.4]]}"#).unwrap();
        assert_eq!(parsed.embeddings.len(), 2);
        assert_eq!(parsed.embeddings[1], vec![0.3, 0.4]);
    }

    #[test]
    fn unreachable_service_is_connection_error() {
        // Port 9 (discard) is not served locally; the connect fails fast.
        let err = OllamaEmbedder::connect("http://127.0.0.1:9/", "nomic-embed-text", 2)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}

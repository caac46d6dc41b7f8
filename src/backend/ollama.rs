use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{agent, blocking_request, check_embedding, request_error, Backend, DESCRIBE_PROMPT};
use crate::config::BackendConfig;
use crate::error::Result;

const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

pub struct OllamaBackend {
    endpoint: String,
    vision_model: String,
    embedding_model: String,
    dimensions: Option<usize>,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            vision_model: config.vision_model.clone().unwrap_or_else(|| "llava".to_string()),
            embedding_model: config
                .embedding_model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            dimensions: config.dimensions,
            agent: agent(config),
        }
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn vision_model(&self) -> &str {
        &self.vision_model
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    async fn describe_image(&self, image: Vec<u8>, cancel: &CancellationToken) -> Result<String> {
        let request = GenerateRequest {
            model: self.vision_model.clone(),
            prompt: DESCRIBE_PROMPT.to_string(),
            images: vec![BASE64.encode(&image)],
            stream: false,
        };
        let url = format!("{}/api/generate", self.endpoint);
        let agent = self.agent.clone();

        let response: GenerateResponse = blocking_request(cancel, move || {
            agent
                .post(&url)
                .set("Content-Type", "application/json")
                .send_json(&request)
                .map_err(|e| request_error("ollama generate", e))?
                .into_json()
                .map_err(|e| request_error("parsing ollama response", e))
        })
        .await?;

        Ok(response.response.trim().to_string())
    }

    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };
        let url = format!("{}/api/embeddings", self.endpoint);
        let agent = self.agent.clone();

        let response: EmbeddingResponse = blocking_request(cancel, move || {
            agent
                .post(&url)
                .set("Content-Type", "application/json")
                .send_json(&request)
                .map_err(|e| request_error("ollama embedding", e))?
                .into_json()
                .map_err(|e| request_error("parsing ollama embedding", e))
        })
        .await?;

        check_embedding(response.embedding, self.dimensions)
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || agent.get(&url).call().map(|r| r.status() == 200).unwrap_or(false))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_unhealthy() {
        let backend = OllamaBackend::new(&BackendConfig {
            endpoint: Some("http://127.0.0.1:9".into()),
            timeout_secs: 1,
            ..BackendConfig::default()
        });
        assert!(!backend.is_healthy().await);
    }

    #[tokio::test]
    async fn test_unreachable_server_embedding_is_transient() {
        let backend = OllamaBackend::new(&BackendConfig {
            endpoint: Some("http://127.0.0.1:9".into()),
            timeout_secs: 1,
            ..BackendConfig::default()
        });
        let err = backend.embed("sunset", &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_transient());
    }
}

//! Hosted OpenAI embeddings. Images never leave the machine, so this backend
//! refuses to describe them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{agent, blocking_request, check_embedding, request_error, Backend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_DIMENSIONS: usize = 512;

pub struct OpenAiBackend {
    endpoint: String,
    api_key: String,
    embedding_model: String,
    dimensions: usize,
    limiter: RateLimiter,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    object: String,
    embedding: Vec<f32>,
}

impl OpenAiBackend {
    /// Uses `config.api_key`, falling back to `OPENAI_API_KEY`.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Backend("OPENAI_API_KEY is not set".into()))?;

        Ok(Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            embedding_model: config
                .embedding_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: config.dimensions.unwrap_or(DEFAULT_DIMENSIONS),
            limiter: RateLimiter::new(config.rate_limit, Duration::from_secs(config.rate_window_secs)),
            agent: agent(config),
        })
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn vision_model(&self) -> &str {
        "none"
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    async fn describe_image(&self, _image: Vec<u8>, _cancel: &CancellationToken) -> Result<String> {
        Err(Error::Backend(
            "openai backend does not describe images; use llama or ollama".into(),
        ))
    }

    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        self.limiter.acquire(cancel).await?;

        let request = EmbeddingRequest {
            input: text.to_string(),
            model: self.embedding_model.clone(),
            dimensions: self.dimensions,
        };
        let url = format!("{}/embeddings", self.endpoint);
        let auth = format!("Bearer {}", self.api_key);
        let agent = self.agent.clone();

        let response: EmbeddingResponse = blocking_request(cancel, move || {
            agent
                .post(&url)
                .set("Content-Type", "application/json")
                .set("Authorization", &auth)
                .send_json(&request)
                .map_err(|e| request_error("openai embedding", e))?
                .into_json()
                .map_err(|e| request_error("parsing openai embedding", e))
        })
        .await?;

        let data = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::Backend("no embedding in openai response".into()))?;
        if data.object != "embedding" {
            return Err(Error::Backend(format!("unexpected object type {:?}", data.object)));
        }
        check_embedding(data.embedding, Some(self.dimensions))
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

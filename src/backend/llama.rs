//! llama.cpp server (`/completion`, `/embedding`, `/health`).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{agent, blocking_request, check_embedding, request_error, Backend, DESCRIBE_PROMPT};
use crate::config::BackendConfig;
use crate::error::Result;

const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

const IMAGE_PREAMBLE: &str = "A chat between a curious human and an artificial intelligence assistant. \
The assistant gives helpful, detailed, and polite answers to the human's questions.\nUSER:";
const IMAGE_SUFFIX: &str = "\nASSISTANT:";
/// Image slot id referenced from the prompt as `[img-10]`.
const IMAGE_ID: u32 = 10;

pub struct LlamaBackend {
    endpoint: String,
    vision_model: String,
    embedding_model: String,
    dimensions: Option<usize>,
    seed: i64,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    prompt: String,
    image_data: Vec<ImageData>,
    n_predict: u32,
    temperature: f32,
    stop: Vec<&'static str>,
    repeat_last_n: u32,
    repeat_penalty: f32,
    top_k: u32,
    top_p: f32,
    cache_prompt: bool,
    stream: bool,
    seed: i64,
}

#[derive(Debug, Serialize)]
struct ImageData {
    data: String,
    id: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl LlamaBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            vision_model: config.vision_model.clone().unwrap_or_else(|| "llava".to_string()),
            embedding_model: config.embedding_model.clone().unwrap_or_else(|| "llama".to_string()),
            dimensions: config.dimensions,
            seed: config.seed,
            agent: agent(config),
        }
    }

    fn completion_request(&self, image: &[u8]) -> CompletionRequest {
        CompletionRequest {
            prompt: format!("{IMAGE_PREAMBLE}[img-{IMAGE_ID}]{DESCRIBE_PROMPT}{IMAGE_SUFFIX}"),
            image_data: vec![ImageData {
                data: BASE64.encode(image),
                id: IMAGE_ID,
            }],
            n_predict: 400,
            temperature: 0.7,
            stop: vec!["</s>", "Llama:", "User:"],
            repeat_last_n: 256,
            repeat_penalty: 1.18,
            top_k: 40,
            top_p: 0.5,
            cache_prompt: true,
            stream: false,
            seed: self.seed,
        }
    }
}

#[async_trait]
impl Backend for LlamaBackend {
    fn name(&self) -> &'static str {
        "llama"
    }

    fn vision_model(&self) -> &str {
        &self.vision_model
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    async fn describe_image(&self, image: Vec<u8>, cancel: &CancellationToken) -> Result<String> {
        let request = self.completion_request(&image);
        let url = format!("{}/completion", self.endpoint);
        let agent = self.agent.clone();

        let response: CompletionResponse = blocking_request(cancel, move || {
            agent
                .post(&url)
                .set("Content-Type", "application/json")
                .send_json(&request)
                .map_err(|e| request_error("llama completion", e))?
                .into_json()
                .map_err(|e| request_error("parsing llama completion", e))
        })
        .await?;

        Ok(response.content.trim_start().to_string())
    }

    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            content: text.to_string(),
        };
        let url = format!("{}/embedding", self.endpoint);
        let agent = self.agent.clone();

        let response: EmbeddingResponse = blocking_request(cancel, move || {
            agent
                .post(&url)
                .set("Content-Type", "application/json")
                .send_json(&request)
                .map_err(|e| request_error("llama embedding", e))?
                .into_json()
                .map_err(|e| request_error("parsing llama embedding", e))
        })
        .await?;

        check_embedding(response.embedding, self.dimensions)
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/health", self.endpoint);
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || agent.get(&url).call().map(|r| r.status() == 200).unwrap_or(false))
            .await
            .unwrap_or(false)
    }
}

//! Description and embedding backends.
//!
//! One backend is chosen from the config at startup and shared as an
//! `Arc<dyn Backend>`; callers never branch on which one is active.

mod llama;
mod ollama;
mod openai;

pub use llama::LlamaBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};

/// Prompt for vision models.
pub(crate) const DESCRIBE_PROMPT: &str = "please describe this image in detail";

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name stored with each description, e.g. "ollama".
    fn name(&self) -> &'static str;

    fn vision_model(&self) -> &str;

    /// Model whose vectors `embed` returns; embeddings are stored and searched per model.
    fn embedding_model(&self) -> &str;

    /// Describes a JPEG image given its full file contents.
    async fn describe_image(&self, image: Vec<u8>, cancel: &CancellationToken) -> Result<String>;

    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>>;

    async fn is_healthy(&self) -> bool;
}

/// Builds the backend selected by `config.kind`.
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.kind {
        BackendKind::Llama => Arc::new(LlamaBackend::new(config)),
        BackendKind::Ollama => Arc::new(OllamaBackend::new(config)),
        BackendKind::OpenAi => Arc::new(OpenAiBackend::new(config)?),
    };
    info!(
        kind = config.kind.as_str(),
        vision_model = backend.vision_model(),
        embedding_model = backend.embedding_model(),
        "Backend selected"
    );
    Ok(backend)
}

pub(crate) fn agent(config: &BackendConfig) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
}

/// Runs a blocking HTTP exchange on the blocking pool. Cancellation abandons
/// the request; the thread finishes in the background.
pub(crate) async fn blocking_request<T, F>(cancel: &CancellationToken, request: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let task = tokio::task::spawn_blocking(request);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        joined = task => joined?,
    }
}

pub(crate) fn request_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Backend(format!("{what} failed: {e}"))
}

/// Accepts a returned embedding only if it is non-empty, finite and, when
/// `dimensions` is set, of that length.
pub(crate) fn check_embedding(vector: Vec<f32>, dimensions: Option<usize>) -> Result<Vec<f32>> {
    if vector.is_empty() {
        return Err(Error::Integrity("backend returned an empty embedding".into()));
    }
    if let Some(expected) = dimensions {
        if vector.len() != expected {
            return Err(Error::Integrity(format!(
                "backend returned {} dimensions, expected {expected}",
                vector.len()
            )));
        }
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::Integrity("backend returned non-finite values".into()));
    }
    Ok(vector)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backend_selects_configured_kind() {
        let mut config = BackendConfig::default();

        config.kind = BackendKind::Llama;
        assert_eq!(create_backend(&config).unwrap().name(), "llama");

        config.kind = BackendKind::Ollama;
        let ollama = create_backend(&config).unwrap();
        assert_eq!(ollama.name(), "ollama");
        assert_eq!(ollama.embedding_model(), "nomic-embed-text");

        config.kind = BackendKind::OpenAi;
        config.api_key = Some("sk-test".into());
        let openai = create_backend(&config).unwrap();
        assert_eq!(openai.name(), "openai");
        assert_eq!(openai.embedding_model(), "text-embedding-3-small");
    }

    #[test]
    fn test_check_embedding() {
        assert!(check_embedding(vec![0.1, 0.2], Some(2)).is_ok());
        assert!(matches!(check_embedding(vec![], None), Err(Error::Integrity(_))));
        assert!(matches!(check_embedding(vec![0.1], Some(2)), Err(Error::Integrity(_))));
        assert!(matches!(
            check_embedding(vec![f32::INFINITY, 0.0], None),
            Err(Error::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_blocking_request_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = blocking_request(&cancel, || Ok(1)).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let live = CancellationToken::new();
        assert_eq!(blocking_request(&live, || Ok(2)).await.unwrap(), 2);
    }
}

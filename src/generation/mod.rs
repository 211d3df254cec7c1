//! Streaming text generation providers.
//!
//! Both adapters issue a single streaming HTTP request and expose the response as a
//! [`TokenStream`] of incremental text. Dropping the stream closes that response only; the
//! shared `reqwest::Client` stays usable for later requests.

mod lines;
mod ollama;
mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use reqwest::Client;
use thiserror::Error;

use crate::config::{Config, GenerationProvider};

pub use lines::LineBuffer;
pub use ollama::OllamaGenerationClient;
pub use openai::OpenAiGenerationClient;

/// Errors surfaced while streaming a generated answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Provider could not be reached or is not configured.
    #[error("Generation provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider rejected the request.
    #[error("Failed to generate answer: {0}")]
    GenerationFailed(String),
    /// A streamed chunk could not be decoded.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
    /// The stream broke before the provider signalled completion.
    #[error("Generation stream interrupted: {0}")]
    Interrupted(String),
}

/// A single generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Complete prompt text.
    pub prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Incremental tokens in arrival order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Interface implemented by streaming generation backends.
#[async_trait]
pub trait GenerationModel: Send + Sync {
    /// Human-readable provider/model label used in logs.
    fn name(&self) -> &str;

    /// Start streaming a completion for `request`.
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, GenerationError>;
}

/// Build the generation model selected by configuration.
pub fn build_generation_model(
    config: &Config,
    http: Client,
) -> Result<Box<dyn GenerationModel>, GenerationError> {
    match config.generation_provider {
        GenerationProvider::Ollama => Ok(Box::new(OllamaGenerationClient::new(
            http,
            config.ollama_url.clone(),
            config.generation_model.clone(),
        ))),
        GenerationProvider::OpenAI => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                GenerationError::ProviderUnavailable("OPENAI_API_KEY is not set".to_string())
            })?;
            Ok(Box::new(OpenAiGenerationClient::new(
                http,
                config.openai_base_url.clone(),
                api_key,
                config.generation_model.clone(),
            )))
        }
    }
}

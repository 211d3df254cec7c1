//! Ollama streaming generation over `/api/generate` (newline-delimited JSON).

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{GenerationError, GenerationModel, GenerationRequest, LineBuffer, TokenStream};

/// Generation client for a local Ollama runtime.
pub struct OllamaGenerationClient {
    http: Client,
    base_url: String,
    model: String,
    label: String,
}

impl OllamaGenerationClient {
    /// Construct a client for the given runtime URL and model.
    pub fn new(http: Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            http,
            base_url: base_url.into(),
            label: format!("ollama:{model}"),
            model,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Meaning of one NDJSON line.
#[derive(Debug, PartialEq)]
enum ChunkEvent {
    Token(String),
    Done,
    Skip,
}

fn parse_line(line: &str) -> Result<ChunkEvent, GenerationError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ChunkEvent::Skip);
    }
    let chunk: OllamaChunk = serde_json::from_str(trimmed)
        .map_err(|error| GenerationError::InvalidResponse(format!("{error}: {trimmed}")))?;
    if let Some(error) = chunk.error {
        return Err(GenerationError::Interrupted(error));
    }
    if chunk.done {
        return Ok(ChunkEvent::Done);
    }
    if chunk.response.is_empty() {
        Ok(ChunkEvent::Skip)
    } else {
        Ok(ChunkEvent::Token(chunk.response))
    }
}

fn token_stream(response: Response) -> impl Stream<Item = Result<String, GenerationError>> + Send {
    try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = LineBuffer::default();
        let mut finished = false;

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|error| GenerationError::Interrupted(error.to_string()))?;
            for line in buffer.push(&chunk) {
                match parse_line(&line)? {
                    ChunkEvent::Token(token) => yield token,
                    ChunkEvent::Done => finished = true,
                    ChunkEvent::Skip => {}
                }
            }
        }

        if let Some(line) = buffer.finish() {
            match parse_line(&line)? {
                ChunkEvent::Token(token) => yield token,
                ChunkEvent::Done => finished = true,
                ChunkEvent::Skip => {}
            }
        }

        if !finished {
            Err(GenerationError::Interrupted(
                "Ollama stream ended before completion".to_string(),
            ))?;
        }
    }
}

#[async_trait]
impl GenerationModel for OllamaGenerationClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, GenerationError> {
        let payload = json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": true,
            "options": {
                "temperature": request.temperature,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                GenerationError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GenerationError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        tracing::debug!(model = %self.model, "Ollama stream opened");
        Ok(Box::pin(token_stream(response)))
    }
}

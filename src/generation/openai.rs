//! OpenAI-compatible streaming chat completions (server-sent events).

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;

use super::{GenerationError, GenerationModel, GenerationRequest, LineBuffer, TokenStream};

/// Generation client for the OpenAI chat completions API.
pub struct OpenAiGenerationClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    label: String,
}

impl OpenAiGenerationClient {
    /// Construct a client for the given API base, key, and model.
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            label: format!("openai:{model}"),
            model,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent, GenerationError> {
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, `event:` and `id:` fields carry no tokens.
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|error| GenerationError::InvalidResponse(format!("{error}: {data}")))?;
    if let Some(error) = chunk.error {
        let message = error
            .message
            .unwrap_or_else(|| "provider reported an error".to_string());
        return Err(GenerationError::Interrupted(format!("OpenAI stream error: {message}")));
    }
    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();
    if content.is_empty() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Token(content))
    }
}

fn token_stream(response: Response) -> impl Stream<Item = Result<String, GenerationError>> + Send {
    try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = LineBuffer::default();
        let mut finished = false;

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|error| GenerationError::Interrupted(error.to_string()))?;
            for line in buffer.push(&chunk) {
                match parse_sse_line(&line)? {
                    SseEvent::Token(token) => yield token,
                    SseEvent::Done => {
                        finished = true;
                        break 'read;
                    }
                    SseEvent::Skip => {}
                }
            }
        }

        if !finished && let Some(line) = buffer.finish() {
            match parse_sse_line(&line)? {
                SseEvent::Token(token) => yield token,
                SseEvent::Done => finished = true,
                SseEvent::Skip => {}
            }
        }

        if !finished {
            Err(GenerationError::Interrupted(
                "OpenAI stream ended without [DONE]".to_string(),
            ))?;
        }
    }
}

#[async_trait]
impl GenerationModel for OpenAiGenerationClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, GenerationError> {
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "stream": true,
            "temperature": request.temperature,
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                GenerationError::ProviderUnavailable(format!("failed to reach OpenAI: {error}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::GenerationFailed(format!(
                "OpenAI returned {status}: {body}"
            )));
        }

        tracing::debug!(model = %self.model, "OpenAI stream opened");
        Ok(Box::pin(token_stream(response)))
    }
}

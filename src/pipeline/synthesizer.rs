//! Answer synthesis over the assembled context.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::generation::{GenerationModel, GenerationRequest};

use super::context::{FALLBACK_ANSWER, build_context, build_prompt};
use super::types::{Answer, AnswerKind, PassageHit, PipelineError};

/// Sampling temperature used for every answer.
pub const TEMPERATURE: f32 = 0.0;

/// Turns retrieved passages into an answer, streaming tokens to an optional sink.
pub struct AnswerSynthesizer {
    model: Arc<dyn GenerationModel>,
}

impl AnswerSynthesizer {
    /// Wrap a generation model.
    pub fn new(model: Arc<dyn GenerationModel>) -> Self {
        Self { model }
    }

    /// Label of the underlying model.
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Produce the answer for `question` from `passages`.
    ///
    /// With no passages the fixed fallback is returned without calling the model; it is sent
    /// to `sink` as a single token. Otherwise tokens are forwarded in arrival order and the
    /// returned text is their concatenation. A closed sink ends the request with
    /// [`PipelineError::Cancelled`] and drops the provider stream.
    pub async fn synthesize(
        &self,
        question: &str,
        passages: &[PassageHit],
        sink: Option<&mpsc::Sender<String>>,
    ) -> Result<Answer, PipelineError> {
        if passages.is_empty() {
            tracing::info!("No passages retrieved; returning fallback answer");
            if let Some(sink) = sink {
                sink.send(FALLBACK_ANSWER.to_string())
                    .await
                    .map_err(|_| PipelineError::Cancelled)?;
            }
            return Ok(Answer {
                text: FALLBACK_ANSWER.to_string(),
                kind: AnswerKind::Fallback,
            });
        }

        let context = build_context(passages);
        let prompt = build_prompt(&context, question);
        tracing::debug!(
            model = self.model.name(),
            context_chars = context.len(),
            "Starting answer generation"
        );

        let mut stream = self
            .model
            .stream(GenerationRequest {
                prompt,
                temperature: TEMPERATURE,
            })
            .await?;

        let mut text = String::new();
        let mut tokens = 0usize;
        loop {
            let item = match sink {
                Some(sink) => tokio::select! {
                    biased;
                    _ = sink.closed() => return Err(PipelineError::Cancelled),
                    item = stream.next() => item,
                },
                None => stream.next().await,
            };
            let Some(token) = item.transpose()? else {
                break;
            };
            if let Some(sink) = sink {
                sink.send(token.clone())
                    .await
                    .map_err(|_| PipelineError::Cancelled)?;
            }
            text.push_str(&token);
            tokens += 1;
        }

        tracing::info!(model = self.model.name(), tokens, "Answer generated");
        Ok(Answer {
            text,
            kind: AnswerKind::Generated,
        })
    }
}

//! Orchestrator wiring the pipeline stages together.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    config::{Config, FailurePolicy},
    embedding::{EmbeddingClient, build_embedding_client},
    generation::{GenerationModel, build_generation_model},
    index::{QdrantIndex, VectorIndex},
    metrics::{MetricsSnapshot, PipelineMetrics},
    qdrant::QdrantService,
};

use super::{
    passages::{PassageRetriever, document_scope},
    summaries::{SummaryRetriever, TermNormalizer},
    synthesizer::AnswerSynthesizer,
    types::{AnswerKind, DocumentDetails, PipelineBuildError, PipelineError, RequestState},
    years::extract_years,
};

/// Tunables of the retrieval stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Summaries fetched per question.
    pub summary_top_k: usize,
    /// Passages fetched per candidate document.
    pub passage_top_k: usize,
    /// Payload key linking summaries and passages to their document.
    pub document_id_field: String,
    /// Passage queries in flight at once.
    pub passage_concurrency: usize,
    /// Handling of a failed passage query.
    pub failure_policy: FailurePolicy,
}

impl PipelineSettings {
    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            summary_top_k: config.summary_top_k,
            passage_top_k: config.passage_top_k,
            document_id_field: config.document_id_field.clone(),
            passage_concurrency: config.passage_concurrency,
            failure_policy: config.passage_failure_policy,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            summary_top_k: 15,
            passage_top_k: 10,
            document_id_field: "id".to_string(),
            passage_concurrency: 1,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

/// Reachability of the vector store and presence of both collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Whether Qdrant answered the collection listing.
    pub reachable: bool,
    /// Whether the summary collection exists.
    pub summary_collection_present: bool,
    /// Whether the passage collection exists.
    pub passage_collection_present: bool,
    /// Diagnostic captured when the probe failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct HealthProbe {
    qdrant: Arc<QdrantService>,
    summary_collection: String,
    passage_collection: String,
}

/// Answers questions by running the two-stage retrieval and synthesis pipeline.
///
/// Holds long-lived handles to both indexes and the generation model. Construct once near
/// process start and share through an `Arc`; requests are independent and may run concurrently.
pub struct AnswerPipeline {
    summaries: SummaryRetriever,
    passages: PassageRetriever,
    synthesizer: AnswerSynthesizer,
    metrics: Arc<PipelineMetrics>,
    health: Option<HealthProbe>,
}

/// Abstraction over the pipeline used by the host surfaces.
#[async_trait]
pub trait AnswerApi: Send + Sync {
    /// Answer `question`, forwarding tokens to `sink` as they arrive.
    async fn answer(
        &self,
        question: &str,
        sink: Option<mpsc::Sender<String>>,
    ) -> Result<RequestState, PipelineError>;

    /// Run retrieval only and return the state after passage retrieval.
    async fn retrieve(&self, question: &str) -> Result<RequestState, PipelineError>;

    /// Stored summary details of one document.
    async fn document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentDetails>, PipelineError>;

    /// Probe backing services.
    async fn health(&self) -> HealthSnapshot;

    /// Current counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

impl AnswerPipeline {
    /// Assemble a pipeline from explicit collaborators.
    pub fn new(
        summary_index: Arc<dyn VectorIndex>,
        passage_index: Arc<dyn VectorIndex>,
        model: Arc<dyn GenerationModel>,
        settings: PipelineSettings,
    ) -> Self {
        let PipelineSettings {
            summary_top_k,
            passage_top_k,
            document_id_field,
            passage_concurrency,
            failure_policy,
        } = settings;
        let metrics = Arc::new(PipelineMetrics::new());
        Self {
            summaries: SummaryRetriever::new(
                summary_index,
                summary_top_k,
                document_id_field.clone(),
                TermNormalizer::default(),
            ),
            passages: PassageRetriever::new(
                passage_index,
                passage_top_k,
                document_id_field,
                passage_concurrency,
                failure_policy,
            )
            .with_metrics(Arc::clone(&metrics)),
            synthesizer: AnswerSynthesizer::new(model),
            metrics,
            health: None,
        }
    }

    /// Build the Qdrant-backed pipeline described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, PipelineBuildError> {
        let http = Client::builder()
            .connect_timeout(config.http_timeout)
            .read_timeout(config.http_timeout)
            .user_agent(concat!("board-rag/", env!("CARGO_PKG_VERSION")))
            .build()?;

        tracing::info!(
            provider = ?config.embedding_provider,
            model = %config.embedding_model,
            "Initializing embedding client"
        );
        let embedding: Arc<dyn EmbeddingClient + Send + Sync> =
            Arc::from(build_embedding_client(config, http.clone())?);
        let qdrant = Arc::new(QdrantService::new(
            http.clone(),
            &config.qdrant_url,
            config.qdrant_api_key.clone(),
        )?);
        let model: Arc<dyn GenerationModel> =
            Arc::from(build_generation_model(config, http)?);
        tracing::info!(model = model.name(), "Generation model initialized");

        let summary_index = Arc::new(QdrantIndex::new(
            Arc::clone(&embedding),
            Arc::clone(&qdrant),
            config.summary_collection.clone(),
            config.content_field.clone(),
            config.embedding_dimension,
        ));
        let passage_index = Arc::new(QdrantIndex::new(
            embedding,
            Arc::clone(&qdrant),
            config.passage_collection.clone(),
            config.content_field.clone(),
            config.embedding_dimension,
        ));

        let mut pipeline = Self::new(
            summary_index,
            passage_index,
            model,
            PipelineSettings::from_config(config),
        );
        pipeline.health = Some(HealthProbe {
            qdrant,
            summary_collection: config.summary_collection.clone(),
            passage_collection: config.passage_collection.clone(),
        });
        Ok(pipeline)
    }

    /// Replace the question normalizer used for summary search.
    pub fn with_normalizer(mut self, normalizer: TermNormalizer) -> Self {
        self.summaries = self.summaries.with_normalizer(normalizer);
        self
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Answer `question`, returning the final request state.
    ///
    /// Tokens are sent to `sink` as they arrive. On success the state is
    /// [`AnswerReady`](super::PipelineStage::AnswerReady); any error ends the request.
    pub async fn answer(
        &self,
        question: &str,
        sink: Option<&mpsc::Sender<String>>,
    ) -> Result<RequestState, PipelineError> {
        self.execute(question, sink, true, "answer").await
    }

    /// Run years extraction and both retrieval stages without generating an answer.
    pub async fn retrieve(&self, question: &str) -> Result<RequestState, PipelineError> {
        self.execute(question, None, false, "retrieve").await
    }

    /// Look up the stored summary of `document_id`.
    ///
    /// `Ok(None)` when the summary index holds nothing for the id.
    pub async fn document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentDetails>, PipelineError> {
        let document_id = document_id.trim();
        if document_id.is_empty() {
            return Err(PipelineError::EmptyDocumentId);
        }
        let span = tracing::info_span!("document", document_id);
        self.summaries
            .document(document_id)
            .instrument(span)
            .await
            .map_err(PipelineError::from)
    }

    async fn execute(
        &self,
        question: &str,
        sink: Option<&mpsc::Sender<String>>,
        generate: bool,
        operation: &'static str,
    ) -> Result<RequestState, PipelineError> {
        self.metrics.record_question();
        let mut state = RequestState::new(question);
        let span = tracing::info_span!("request", request_id = %state.request_id(), operation);

        let outcome = self
            .run(&mut state, sink, generate)
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        match outcome {
            Ok(()) => {
                tracing::info!(
                    stage = ?state.stage(),
                    documents = state.sources().len(),
                    passages = state.passage_hits().len(),
                    "Request completed"
                );
                Ok(state)
            }
            Err(error) => {
                state.record_failure();
                self.metrics.record_failure();
                match &error {
                    PipelineError::EmptyQuestion
                    | PipelineError::EmptyDocumentId
                    | PipelineError::Cancelled => {
                        tracing::warn!(%error, "Request ended early")
                    }
                    _ => tracing::error!(%error, "Request failed"),
                }
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        state: &mut RequestState,
        sink: Option<&mpsc::Sender<String>>,
        generate: bool,
    ) -> Result<(), PipelineError> {
        let question = state.question().to_string();
        if question.trim().is_empty() {
            return Err(PipelineError::EmptyQuestion);
        }

        state.record_years(extract_years(&question));

        let summaries = self.summaries.retrieve(&question, state.years()).await?;
        state.record_summaries(summaries);

        let scope = document_scope(state.summary_hits());
        let passages = self.passages.retrieve(&question, &scope).await?;
        state.record_passages(passages);

        if !generate {
            return Ok(());
        }

        let answer = self
            .synthesizer
            .synthesize(&question, state.passage_hits(), sink)
            .await?;
        match answer.kind {
            AnswerKind::Generated => self.metrics.record_generated(),
            AnswerKind::Fallback => self.metrics.record_fallback(),
        }
        state.record_answer(answer);
        Ok(())
    }

    /// Probe Qdrant for reachability and collection presence.
    pub async fn health(&self) -> HealthSnapshot {
        let Some(probe) = &self.health else {
            return HealthSnapshot {
                reachable: false,
                summary_collection_present: false,
                passage_collection_present: false,
                error: Some("no vector store probe configured".to_string()),
            };
        };
        match probe.qdrant.list_collections().await {
            Ok(collections) => HealthSnapshot {
                reachable: true,
                summary_collection_present: collections.contains(&probe.summary_collection),
                passage_collection_present: collections.contains(&probe.passage_collection),
                error: None,
            },
            Err(error) => {
                tracing::warn!(error = %error, "Qdrant health probe failed");
                HealthSnapshot {
                    reachable: false,
                    summary_collection_present: false,
                    passage_collection_present: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl AnswerApi for AnswerPipeline {
    async fn answer(
        &self,
        question: &str,
        sink: Option<mpsc::Sender<String>>,
    ) -> Result<RequestState, PipelineError> {
        AnswerPipeline::answer(self, question, sink.as_ref()).await
    }

    async fn retrieve(&self, question: &str) -> Result<RequestState, PipelineError> {
        AnswerPipeline::retrieve(self, question).await
    }

    async fn document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentDetails>, PipelineError> {
        AnswerPipeline::document(self, document_id).await
    }

    async fn health(&self) -> HealthSnapshot {
        AnswerPipeline::health(self).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

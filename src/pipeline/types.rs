//! Request state, stage records, and error definitions for the answer pipeline.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    embedding::EmbeddingClientError,
    generation::GenerationError,
    index::{RetrievalError, scalar_text},
    qdrant::QdrantError,
};

/// Errors that terminate a request in the [`PipelineStage::Failed`] state.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The question was empty or whitespace only.
    #[error("Question must not be empty")]
    EmptyQuestion,
    /// A document lookup was requested without an id.
    #[error("Document id must not be empty")]
    EmptyDocumentId,
    /// A summary or passage search failed.
    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    /// The generation stream failed to start or broke mid-stream.
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),
    /// The token consumer went away before the answer was complete.
    #[error("Request cancelled by the caller")]
    Cancelled,
}

/// Errors raised while wiring the pipeline from configuration.
#[derive(Debug, Error)]
pub enum PipelineBuildError {
    /// Shared HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    /// Qdrant transport could not be initialized.
    #[error("Failed to initialize Qdrant client: {0}")]
    Qdrant(#[from] QdrantError),
    /// Embedding provider could not be initialized.
    #[error("Failed to initialize embedding client: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Generation provider could not be initialized.
    #[error("Failed to initialize generation model: {0}")]
    Generation(#[from] GenerationError),
}

/// Position of a request in the linear pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Question received; nothing derived yet.
    Start,
    /// Temporal filter extracted.
    YearsExtracted,
    /// Candidate documents retrieved from the summary index.
    SummariesRetrieved,
    /// Passages retrieved from the passage index.
    PassagesRetrieved,
    /// Answer complete. Only success terminal.
    AnswerReady,
    /// Unrecovered failure. Terminal.
    Failed,
}

impl PipelineStage {
    /// Successor on the nominal path, `None` for terminal stages.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::YearsExtracted),
            Self::YearsExtracted => Some(Self::SummariesRetrieved),
            Self::SummariesRetrieved => Some(Self::PassagesRetrieved),
            Self::PassagesRetrieved => Some(Self::AnswerReady),
            Self::AnswerReady | Self::Failed => None,
        }
    }

    /// Whether the stage ends the request.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AnswerReady | Self::Failed)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: Self) -> bool {
        if to == Self::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(to)
    }
}

/// Summary record returned by the summary index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryHit {
    /// Source document identifier, when the payload carries one.
    pub document_id: Option<String>,
    /// Similarity score.
    pub score: f32,
    /// Summary text.
    pub content: String,
    /// Remaining payload fields (year, name, links).
    pub metadata: Map<String, Value>,
}

/// Passage record returned by the passage index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassageHit {
    /// Identifier of the document the passage belongs to.
    pub document_id: String,
    /// Similarity score.
    pub score: f32,
    /// Passage text.
    pub text: String,
    /// Remaining payload fields (year, name, links).
    pub metadata: Map<String, Value>,
}

/// Whether the answer came from the model or the no-documents fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    /// Streamed from the generation model.
    Generated,
    /// Fixed fallback; no model call was made.
    Fallback,
}

/// A finished answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Full answer text.
    pub text: String,
    /// Origin of the text.
    pub kind: AnswerKind,
}

/// Distinct source document backing a set of passages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRef {
    /// Source document identifier.
    pub id: String,
    /// Display name, `Untitled` when absent.
    pub name: String,
    /// Board year, `unknown` when absent.
    pub year: String,
    /// Best summary score of the document, or its best passage score.
    pub score: f32,
    /// Passages contributed by the document.
    pub passages: usize,
    /// Link to the original document, when the payload carries one.
    pub link: Option<String>,
}

/// Summary-level details of one document, looked up by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentDetails {
    /// Source document identifier.
    pub id: String,
    /// Display name, `Untitled` when absent.
    pub name: String,
    /// Board year, `unknown` when absent.
    pub year: String,
    /// Stored summary text.
    pub summary: String,
    /// Link to the original document, when the payload carries one.
    pub link: Option<String>,
}

/// State of one request, assembled by the orchestrator from each stage's output.
///
/// Fields are read-only outside the pipeline; each stage returns only its own output.
#[derive(Debug, Clone)]
pub struct RequestState {
    request_id: Uuid,
    question: String,
    stage: PipelineStage,
    years: BTreeSet<String>,
    summary_hits: Vec<SummaryHit>,
    passage_hits: Vec<PassageHit>,
    answer: Option<Answer>,
}

impl RequestState {
    pub(crate) fn new(question: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            question: question.into(),
            stage: PipelineStage::Start,
            years: BTreeSet::new(),
            summary_hits: Vec::new(),
            passage_hits: Vec::new(),
            answer: None,
        }
    }

    fn advance(&mut self, to: PipelineStage) {
        debug_assert!(
            self.stage.can_transition(to),
            "illegal transition {:?} -> {to:?}",
            self.stage
        );
        tracing::debug!(from = ?self.stage, to = ?to, "Pipeline stage advanced");
        self.stage = to;
    }

    pub(crate) fn record_years(&mut self, years: BTreeSet<String>) {
        self.years = years;
        self.advance(PipelineStage::YearsExtracted);
    }

    pub(crate) fn record_summaries(&mut self, hits: Vec<SummaryHit>) {
        self.summary_hits = hits;
        self.advance(PipelineStage::SummariesRetrieved);
    }

    pub(crate) fn record_passages(&mut self, hits: Vec<PassageHit>) {
        self.passage_hits = hits;
        self.advance(PipelineStage::PassagesRetrieved);
    }

    pub(crate) fn record_answer(&mut self, answer: Answer) {
        self.answer = Some(answer);
        self.advance(PipelineStage::AnswerReady);
    }

    pub(crate) fn record_failure(&mut self) {
        self.advance(PipelineStage::Failed);
    }

    /// Identifier used to correlate log lines of this request.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Original question text.
    pub fn question(&self) -> &str {
        &self.question
    }

    /// Current stage.
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Extracted years; empty means no temporal filter.
    pub fn years(&self) -> &BTreeSet<String> {
        &self.years
    }

    /// Retrieved summaries in rank order.
    pub fn summary_hits(&self) -> &[SummaryHit] {
        &self.summary_hits
    }

    /// Retrieved passages, grouped per document in document order.
    pub fn passage_hits(&self) -> &[PassageHit] {
        &self.passage_hits
    }

    /// Final answer, present only in [`PipelineStage::AnswerReady`].
    pub fn answer(&self) -> Option<&Answer> {
        self.answer.as_ref()
    }

    /// Distinct documents that contributed passages, in passage order.
    pub fn sources(&self) -> Vec<DocumentRef> {
        let summary_scores: HashMap<&str, f32> =
            self.summary_hits
                .iter()
                .fold(HashMap::new(), |mut scores, hit| {
                    if let Some(id) = hit.document_id.as_deref() {
                        let entry = scores.entry(id).or_insert(hit.score);
                        *entry = entry.max(hit.score);
                    }
                    scores
                });

        let mut sources: Vec<DocumentRef> = Vec::new();
        for hit in &self.passage_hits {
            if let Some(existing) = sources.iter_mut().find(|doc| doc.id == hit.document_id) {
                existing.passages += 1;
                if !summary_scores.contains_key(hit.document_id.as_str()) {
                    existing.score = existing.score.max(hit.score);
                }
                continue;
            }
            sources.push(DocumentRef {
                id: hit.document_id.clone(),
                name: name_label(&hit.metadata),
                year: year_label(&hit.metadata),
                score: summary_scores
                    .get(hit.document_id.as_str())
                    .copied()
                    .unwrap_or(hit.score),
                passages: 1,
                link: link_label(&hit.metadata),
            });
        }
        sources
    }
}

/// Display form of a payload `year`: integral numbers lose their fraction, absent is `unknown`.
pub fn year_label(metadata: &Map<String, Value>) -> String {
    match metadata.get("year") {
        None | Some(Value::Null) => "unknown".to_string(),
        Some(Value::String(text)) => match text.trim().parse::<f64>() {
            Ok(number) if number.is_finite() => format!("{}", number.trunc() as i64),
            _ => text.trim().to_string(),
        },
        Some(Value::Number(number)) => match number.as_f64() {
            Some(float) => format!("{}", float.trunc() as i64),
            None => number.to_string(),
        },
        Some(other) => scalar_text(other).unwrap_or_else(|| other.to_string()),
    }
}

/// Payload keys that may carry a document link, in order of preference.
pub const LINK_KEYS: [&str; 4] = ["url", "google_drive_link", "drive_link", "link"];

/// First non-empty link among [`LINK_KEYS`].
pub fn link_label(metadata: &Map<String, Value>) -> Option<String> {
    LINK_KEYS.iter().find_map(|key| match metadata.get(*key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    })
}

/// Display form of a payload `name`, `Untitled` when absent.
pub fn name_label(metadata: &Map<String, Value>) -> String {
    match metadata.get("name") {
        None | Some(Value::Null) => "Untitled".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => scalar_text(other).unwrap_or_else(|| other.to_string()),
    }
}

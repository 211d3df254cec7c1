//! Two-stage retrieval-augmented answer pipeline.
//!
//! A question flows through years extraction, summary retrieval, passage retrieval and answer
//! synthesis. Each stage returns its own output and [`AnswerPipeline`] records it on the
//! request's [`RequestState`].

pub mod context;
pub mod passages;
pub mod service;
pub mod summaries;
pub mod synthesizer;
pub mod types;
pub mod years;

pub use context::{BLOCK_SEPARATOR, FALLBACK_ANSWER, build_context, build_prompt};
pub use passages::{PassageRetriever, document_scope};
pub use service::{AnswerApi, AnswerPipeline, HealthSnapshot, PipelineSettings};
pub use summaries::{SummaryRetriever, TermNormalizer};
pub use synthesizer::AnswerSynthesizer;
pub use types::{
    Answer, AnswerKind, DocumentDetails, DocumentRef, PassageHit, PipelineBuildError, PipelineError,
    PipelineStage, RequestState, SummaryHit,
};
pub use years::extract_years;

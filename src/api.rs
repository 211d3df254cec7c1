//! HTTP surface for the board document answer service.
//!
//! This module exposes a compact Axum router:
//!
//! - `POST /ask` – Answer a question as a server-sent event stream. Each token arrives as
//!   `data: {"content": "..."}`, followed by `data: [DONE]`, or an `error` event on failure.
//! - `POST /answer` – Answer a question and return `{ answer, kind, years, documents }` once
//!   complete.
//! - `POST /search` – Run retrieval only and return `{ years, documents, chunks }`.
//! - `POST /documents` – Look up a document's stored summary, name, year and link by id.
//! - `GET /metrics` – Observe question-answering counters.
//! - `GET /health` – Probe Qdrant and report whether both collections exist.
//!
//! Both the HTTP surface and the `board-ask` CLI share the same pipeline, so answers are
//! identical across interfaces.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::metrics::MetricsSnapshot;
use crate::pipeline::{
    AnswerApi, AnswerKind, DocumentDetails, DocumentRef, HealthSnapshot, PipelineError,
    RequestState,
    types::{link_label, name_label, year_label},
};

/// Tokens buffered between the pipeline task and the event stream.
const TOKEN_BUFFER: usize = 64;

/// Build the HTTP router exposing the question-answering surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: AnswerApi + 'static,
{
    Router::new()
        .route("/ask", post(ask::<S>))
        .route("/answer", post(answer::<S>))
        .route("/search", post(search::<S>))
        .route("/documents", post(document::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/health", get(get_health::<S>))
        .with_state(service)
}

/// Request body shared by the question endpoints.
#[derive(Deserialize)]
struct QuestionRequest {
    /// Natural-language question about the board documents.
    question: String,
}

/// Request body for `POST /documents`.
#[derive(Deserialize)]
struct DocumentRequest {
    id: String,
}

/// Success response for `POST /answer`.
#[derive(Serialize)]
struct AnswerResponse {
    answer: String,
    kind: AnswerKind,
    years: Vec<String>,
    documents: Vec<DocumentRef>,
}

/// One retrieved passage in `POST /search` responses.
#[derive(Serialize)]
struct ChunkView {
    document_id: String,
    name: String,
    year: String,
    score: f32,
    text: String,
    link: Option<String>,
}

/// Success response for `POST /search`.
#[derive(Serialize)]
struct SearchResponse {
    years: Vec<String>,
    documents: Vec<DocumentRef>,
    chunks: Vec<ChunkView>,
}

fn sse_event(event: Event) -> Result<Event, Infallible> {
    Ok(event)
}

/// Stream the answer to a question as server-sent events.
///
/// The pipeline runs on its own task. Dropping the response drops the token receiver, which
/// stops generation on the next token.
async fn ask<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<QuestionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError>
where
    S: AnswerApi + 'static,
{
    let QuestionRequest { question } = request;
    if question.trim().is_empty() {
        return Err(PipelineError::EmptyQuestion.into());
    }

    let (tx, mut rx) = mpsc::channel::<String>(TOKEN_BUFFER);
    let task = tokio::spawn(async move { service.answer(&question, Some(tx)).await });

    let events = stream! {
        while let Some(token) = rx.recv().await {
            yield sse_event(Event::default().data(json!({ "content": token }).to_string()));
        }
        let failure = match task.await {
            Ok(Ok(_)) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(join_error) => Some(format!("answer task failed: {join_error}")),
        };
        match failure {
            None => yield sse_event(Event::default().data("[DONE]")),
            Some(message) => {
                tracing::warn!(error = %message, "Streaming answer failed");
                yield sse_event(
                    Event::default()
                        .event("error")
                        .data(json!({ "error": message }).to_string()),
                );
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Answer a question and return the complete text with its sources.
async fn answer<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<QuestionRequest>,
) -> Result<Json<AnswerResponse>, AppError>
where
    S: AnswerApi,
{
    let state = service.answer(&request.question, None).await?;
    let (answer, kind) = match state.answer() {
        Some(answer) => (answer.text.clone(), answer.kind),
        None => return Err(AppError::incomplete(&state)),
    };
    Ok(Json(AnswerResponse {
        answer,
        kind,
        years: state.years().iter().cloned().collect(),
        documents: state.sources(),
    }))
}

/// Retrieve the documents and passages a question would be answered from.
async fn search<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<QuestionRequest>,
) -> Result<Json<SearchResponse>, AppError>
where
    S: AnswerApi,
{
    let state = service.retrieve(&request.question).await?;
    let chunks = state
        .passage_hits()
        .iter()
        .map(|hit| ChunkView {
            document_id: hit.document_id.clone(),
            name: name_label(&hit.metadata),
            year: year_label(&hit.metadata),
            score: hit.score,
            text: hit.text.clone(),
            link: link_label(&hit.metadata),
        })
        .collect();
    Ok(Json(SearchResponse {
        years: state.years().iter().cloned().collect(),
        documents: state.sources(),
        chunks,
    }))
}

/// Look up one document's stored summary; `404` when the id is unknown.
async fn document<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<DocumentRequest>,
) -> Result<Json<DocumentDetails>, AppError>
where
    S: AnswerApi,
{
    match service.document(&request.id).await? {
        Some(details) => Ok(Json(details)),
        None => Err(AppError {
            status: StatusCode::NOT_FOUND,
            message: format!("Document {} not found", request.id.trim()),
        }),
    }
}

/// Return the current question-answering counters.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: AnswerApi,
{
    Json(service.metrics_snapshot())
}

/// Report vector store reachability; `503` when Qdrant cannot be reached.
async fn get_health<S>(State(service): State<Arc<S>>) -> (StatusCode, Json<HealthSnapshot>)
where
    S: AnswerApi,
{
    let health = service.health().await;
    let status = if health.reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn incomplete(state: &RequestState) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("request ended in stage {:?} without an answer", state.stage()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        let status = match inner {
            PipelineError::EmptyQuestion | PipelineError::EmptyDocumentId => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Retrieval(_) | PipelineError::Generation(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: inner.to_string(),
        }
    }
}

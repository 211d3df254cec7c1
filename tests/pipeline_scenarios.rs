use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use boardrag::{
    config::FailurePolicy,
    generation::{GenerationError, GenerationModel, GenerationRequest, TokenStream},
    index::{FieldMatch, IndexFilter, IndexRecord, RetrievalError, VectorIndex},
    pipeline::{
        AnswerKind, AnswerPipeline, FALLBACK_ANSWER, PipelineError, PipelineSettings,
        PipelineStage,
    },
};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

type SearchCall = (String, usize, Option<IndexFilter>);

/// Index returning its stored records that pass the filter, in insertion order.
struct MemoryIndex {
    name: &'static str,
    records: Vec<IndexRecord>,
    failing_documents: Vec<String>,
    calls: Mutex<Vec<SearchCall>>,
}

impl MemoryIndex {
    fn new(name: &'static str, records: Vec<IndexRecord>) -> Arc<Self> {
        Arc::new(Self {
            name,
            records,
            failing_documents: Vec::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing_for(name: &'static str, records: Vec<IndexRecord>, document: &str) -> Arc<Self> {
        Arc::new(Self {
            name,
            records,
            failing_documents: vec![document.to_string()],
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<SearchCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        self.name
    }

    async fn search(
        &self,
        query_text: &str,
        top_k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexRecord>, RetrievalError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((query_text.to_string(), top_k, filter.cloned()));
        if let Some(IndexFilter {
            matches: FieldMatch::Equals(document),
            ..
        }) = filter
            && self.failing_documents.contains(document)
        {
            return Err(RetrievalError::Unavailable(format!("{document} timed out")));
        }
        Ok(self
            .records
            .iter()
            .filter(|record| filter.is_none_or(|filter| filter.accepts(&record.metadata)))
            .take(top_k)
            .cloned()
            .collect())
    }

    async fn fetch(
        &self,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<IndexRecord>, RetrievalError> {
        Ok(self
            .records
            .iter()
            .filter(|record| filter.accepts(&record.metadata))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Model that streams a fixed script and records every prompt.
struct ScriptedModel {
    script: Vec<&'static str>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedModel {
    fn new(script: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            script,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl GenerationModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, GenerationError> {
        self.requests.lock().expect("requests lock").push(request);
        let tokens: Vec<Result<String, GenerationError>> =
            self.script.iter().map(|token| Ok(token.to_string())).collect();
        Ok(Box::pin(futures_util::stream::iter(tokens)))
    }
}

fn record(id: &str, content: &str, payload: Value) -> IndexRecord {
    IndexRecord {
        id: id.to_string(),
        score: 0.75,
        content: content.to_string(),
        metadata: payload.as_object().cloned().unwrap_or_else(Map::new),
    }
}

fn board_summaries() -> Vec<IndexRecord> {
    vec![
        record(
            "s1",
            "Board 2022 approved the events budget.",
            json!({ "id": "doc-2022", "name": "Budget 2022", "year": 2022 }),
        ),
        record(
            "s2",
            "Board 2021 planned the hackathon.",
            json!({ "id": "doc-2021", "name": "Plan 2021", "year": "2021" }),
        ),
    ]
}

fn board_passages() -> Vec<IndexRecord> {
    vec![
        record(
            "p1",
            "The 2022 events budget was 5000 EUR.",
            json!({ "id": "doc-2022", "name": "Budget 2022", "year": 2022 }),
        ),
        record(
            "p2",
            "Hackathon venue booked for spring.",
            json!({ "id": "doc-2021", "name": "Plan 2021", "year": 2021 }),
        ),
    ]
}

fn pipeline(
    summaries: Arc<MemoryIndex>,
    passages: Arc<MemoryIndex>,
    model: Arc<ScriptedModel>,
) -> AnswerPipeline {
    AnswerPipeline::new(summaries, passages, model, PipelineSettings::default())
}

fn passage_documents(calls: &[SearchCall]) -> Vec<String> {
    calls
        .iter()
        .map(|(_, _, filter)| match filter.as_ref().map(|f| &f.matches) {
            Some(FieldMatch::Equals(id)) => id.clone(),
            other => panic!("passage query without equality filter: {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn year_question_is_answered_from_that_year() {
    let summaries = MemoryIndex::new("summaries", board_summaries());
    let passages = MemoryIndex::new("passages", board_passages());
    let model = ScriptedModel::new(vec!["In 2022, ", "the board approved ", "5000 EUR."]);
    let service = pipeline(summaries.clone(), passages.clone(), model.clone());

    let state = service
        .answer("What happened in 2022?", None)
        .await
        .expect("answer");

    assert_eq!(state.stage(), PipelineStage::AnswerReady);
    assert_eq!(state.years().iter().collect::<Vec<_>>(), vec!["2022"]);

    let summary_calls = summaries.calls();
    assert_eq!(summary_calls.len(), 1);
    assert_eq!(summary_calls[0].1, 15);
    assert_eq!(
        summary_calls[0].2,
        Some(IndexFilter::any_of("year", ["2022"]))
    );

    let passage_calls = passages.calls();
    assert_eq!(passage_documents(&passage_calls), vec!["doc-2022"]);
    assert_eq!(passage_calls[0].0, "What happened in 2022?");
    assert_eq!(passage_calls[0].1, 10);

    let answer = state.answer().expect("answer present");
    assert_eq!(answer.kind, AnswerKind::Generated);
    assert!(answer.text.contains("2022"));

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].temperature, 0.0);
    assert!(requests[0]
        .prompt
        .contains("Document 'Budget 2022' from Board 2022:The 2022 events budget was 5000 EUR."));
    assert!(!requests[0].prompt.contains("Hackathon"));

    let sources = state.sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].id, "doc-2022");
}

#[tokio::test]
async fn no_matching_summaries_returns_fallback_verbatim() {
    let summaries = MemoryIndex::new("summaries", Vec::new());
    let passages = MemoryIndex::new("passages", board_passages());
    let model = ScriptedModel::new(vec!["unused"]);
    let service = pipeline(summaries.clone(), passages.clone(), model.clone());

    let state = service
        .answer("Who organized the sauna evening?", None)
        .await
        .expect("answer");

    assert!(state.years().is_empty());
    assert_eq!(summaries.calls()[0].2, None);
    assert!(state.summary_hits().is_empty());
    assert!(state.passage_hits().is_empty());
    assert!(passages.calls().is_empty());
    assert!(model.requests().is_empty());

    let answer = state.answer().expect("answer present");
    assert_eq!(answer.kind, AnswerKind::Fallback);
    assert_eq!(
        answer.text,
        "I could not find any documents related to your question."
    );
}

#[tokio::test]
async fn shared_document_is_queried_once() {
    let summaries = MemoryIndex::new(
        "summaries",
        vec![
            record("s1", "Budget overview", json!({ "id": "doc-1", "year": 2023 })),
            record("s2", "Budget details", json!({ "id": "doc-1", "year": 2023 })),
            record("s3", "Event recap", json!({ "id": "doc-2", "year": 2023 })),
        ],
    );
    let passages = MemoryIndex::new(
        "passages",
        vec![
            record(
                "p1",
                "Budget line items",
                json!({ "id": "doc-1", "name": "Budget", "year": 2023 }),
            ),
            record(
                "p2",
                "Event attendance",
                json!({ "id": "doc-2", "name": "Recap", "year": 2023 }),
            ),
        ],
    );
    let model = ScriptedModel::new(vec!["ok"]);
    let service = pipeline(summaries, passages.clone(), model);

    service.answer("Budget and events?", None).await.expect("answer");

    assert_eq!(passage_documents(&passages.calls()), vec!["doc-1", "doc-2"]);
}

#[tokio::test]
async fn missing_metadata_renders_default_labels() {
    let summaries = MemoryIndex::new(
        "summaries",
        vec![record("s1", "Unlabelled summary", json!({ "id": "doc-x" }))],
    );
    let passages = MemoryIndex::new(
        "passages",
        vec![record("p1", "Loose notes", json!({ "id": "doc-x" }))],
    );
    let model = ScriptedModel::new(vec!["noted"]);
    let service = pipeline(summaries, passages, model.clone());

    let state = service.answer("What are the notes?", None).await.expect("answer");

    let prompt = &model.requests()[0].prompt;
    assert!(prompt.contains("Document 'Untitled' from Board unknown:Loose notes"));
    let sources = state.sources();
    assert_eq!(sources[0].name, "Untitled");
    assert_eq!(sources[0].year, "unknown");
}

#[tokio::test]
async fn duplicate_passage_blocks_appear_once_in_prompt() {
    let summaries = MemoryIndex::new(
        "summaries",
        vec![record("s1", "Minutes", json!({ "id": "doc-1" }))],
    );
    let payload = json!({ "id": "doc-1", "name": "Minutes", "year": 2020 });
    let passages = MemoryIndex::new(
        "passages",
        vec![
            record("p1", "Board met twice.", payload.clone()),
            record("p2", "Board met twice.", payload.clone()),
            record("p3", "Treasurer elected.", payload),
        ],
    );
    let model = ScriptedModel::new(vec!["twice"]);
    let service = pipeline(summaries, passages, model.clone());

    service.answer("How often did the board meet?", None).await.expect("answer");

    let prompt = &model.requests()[0].prompt;
    assert_eq!(prompt.matches("Board met twice.").count(), 1);
    assert!(prompt.contains(
        "Document 'Minutes' from Board 2020:Board met twice.\n\n---\n\nDocument 'Minutes' from Board 2020:Treasurer elected."
    ));
}

#[tokio::test]
async fn streamed_tokens_match_the_final_answer() {
    let summaries = MemoryIndex::new("summaries", board_summaries());
    let passages = MemoryIndex::new("passages", board_passages());
    let model = ScriptedModel::new(vec!["Both ", "years ", "differ."]);
    let service = pipeline(summaries, passages, model);
    let (tx, mut rx) = mpsc::channel(16);

    let state = service
        .answer("Compare 2021 and 2022", Some(&tx))
        .await
        .expect("answer");
    drop(tx);

    let mut streamed = String::new();
    while let Some(token) = rx.recv().await {
        streamed.push_str(&token);
    }
    assert_eq!(streamed, "Both years differ.");
    assert_eq!(state.answer().expect("answer").text, streamed);
    assert_eq!(state.years().len(), 2);
}

#[tokio::test]
async fn fallback_is_streamed_as_one_token() {
    let summaries = MemoryIndex::new("summaries", Vec::new());
    let passages = MemoryIndex::new("passages", Vec::new());
    let service = pipeline(summaries, passages, ScriptedModel::new(vec![]));
    let (tx, mut rx) = mpsc::channel(4);

    service.answer("Anything?", Some(&tx)).await.expect("fallback");
    drop(tx);

    assert_eq!(rx.recv().await.as_deref(), Some(FALLBACK_ANSWER));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn dropped_receiver_cancels_the_request() {
    let summaries = MemoryIndex::new("summaries", board_summaries());
    let passages = MemoryIndex::new("passages", board_passages());
    let service = pipeline(summaries, passages, ScriptedModel::new(vec!["a", "b", "c"]));
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let error = service
        .answer("What happened in 2022?", Some(&tx))
        .await
        .expect_err("cancelled");

    assert!(matches!(error, PipelineError::Cancelled));
    assert_eq!(service.metrics().snapshot().failures, 1);
}

#[tokio::test]
async fn blank_question_is_rejected_before_retrieval() {
    let summaries = MemoryIndex::new("summaries", board_summaries());
    let passages = MemoryIndex::new("passages", board_passages());
    let service = pipeline(summaries.clone(), passages, ScriptedModel::new(vec![]));

    let error = service.answer(" \n\t", None).await.expect_err("empty");

    assert!(matches!(error, PipelineError::EmptyQuestion));
    assert!(summaries.calls().is_empty());
}

#[tokio::test]
async fn summary_failure_fails_the_request() {
    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
        fn name(&self) -> &str {
            "down"
        }

        async fn search(
            &self,
            _query_text: &str,
            _top_k: usize,
            _filter: Option<&IndexFilter>,
        ) -> Result<Vec<IndexRecord>, RetrievalError> {
            Err(RetrievalError::Unavailable("connection refused".into()))
        }
    }

    let passages = MemoryIndex::new("passages", board_passages());
    let model = ScriptedModel::new(vec!["unused"]);
    let service = AnswerPipeline::new(
        Arc::new(DownIndex),
        passages.clone(),
        model.clone(),
        PipelineSettings::default(),
    );

    let error = service.answer("Any board news?", None).await.expect_err("failure");

    assert!(matches!(error, PipelineError::Retrieval(_)));
    assert!(passages.calls().is_empty());
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn passage_failure_policy_controls_partial_results() {
    let settings = |policy| PipelineSettings {
        passage_concurrency: 2,
        failure_policy: policy,
        ..PipelineSettings::default()
    };
    let summaries = || MemoryIndex::new("summaries", board_summaries());
    let passages = || MemoryIndex::failing_for("passages", board_passages(), "doc-2022");

    let strict = AnswerPipeline::new(
        summaries(),
        passages(),
        ScriptedModel::new(vec!["x"]),
        settings(FailurePolicy::FailFast),
    );
    let error = strict.retrieve("budget").await.expect_err("fail fast");
    assert!(matches!(error, PipelineError::Retrieval(_)));

    let lenient = AnswerPipeline::new(
        summaries(),
        passages(),
        ScriptedModel::new(vec!["x"]),
        settings(FailurePolicy::Isolate),
    );
    let state = lenient.retrieve("budget").await.expect("isolated");
    assert_eq!(state.stage(), PipelineStage::PassagesRetrieved);
    let documents: Vec<&str> = state
        .passage_hits()
        .iter()
        .map(|hit| hit.document_id.as_str())
        .collect();
    assert_eq!(documents, vec!["doc-2021"]);
}

#[tokio::test]
async fn fail_fast_counts_only_issued_passage_queries() {
    let summaries = MemoryIndex::new("summaries", board_summaries());
    let passages = MemoryIndex::failing_for("passages", board_passages(), "doc-2022");
    let service = pipeline(summaries, passages.clone(), ScriptedModel::new(vec!["x"]));

    service.answer("budget", None).await.expect_err("fail fast");

    assert_eq!(passages.calls().len(), 1);
    assert_eq!(service.metrics().snapshot().passage_queries, 1);
}

#[tokio::test]
async fn document_details_come_from_the_summary_index() {
    let summaries = MemoryIndex::new(
        "summaries",
        vec![record(
            "s9",
            "Board 2019 reorganized the teams.",
            json!({
                "id": "doc-2019",
                "name": "Strategy",
                "year": 2019.0,
                "google_drive_link": "https://drive.example/doc-2019"
            }),
        )],
    );
    let passages = MemoryIndex::new("passages", Vec::new());
    let service = pipeline(summaries.clone(), passages, ScriptedModel::new(vec![]));

    let details = service
        .document("doc-2019")
        .await
        .expect("lookup")
        .expect("document found");

    assert_eq!(details.name, "Strategy");
    assert_eq!(details.year, "2019");
    assert_eq!(details.summary, "Board 2019 reorganized the teams.");
    assert_eq!(details.link.as_deref(), Some("https://drive.example/doc-2019"));
    assert!(summaries.calls().is_empty());
    assert!(service.document("doc-0").await.expect("lookup").is_none());
}

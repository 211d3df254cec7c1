//! Passage-level retrieval scoped to candidate documents.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{StreamExt, stream};

use crate::config::FailurePolicy;
use crate::index::{IndexFilter, IndexRecord, RetrievalError, VectorIndex};
use crate::metrics::PipelineMetrics;

use super::types::{PassageHit, SummaryHit};

/// Unique document ids of `summaries`, in first-seen order.
///
/// Summaries without an id cannot scope a passage query and are left out.
pub fn document_scope(summaries: &[SummaryHit]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut missing = 0usize;
    let mut scope = Vec::new();
    for hit in summaries {
        match hit.document_id.as_deref() {
            Some(id) => {
                if seen.insert(id) {
                    scope.push(id.to_string());
                }
            }
            None => missing += 1,
        }
    }
    if missing > 0 {
        tracing::warn!(missing, "Summaries without a document id were skipped");
    }
    scope
}

/// Runs one filtered passage search per candidate document.
pub struct PassageRetriever {
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    document_id_field: String,
    concurrency: usize,
    policy: FailurePolicy,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl PassageRetriever {
    /// Bind the retriever to a passage index.
    pub fn new(
        index: Arc<dyn VectorIndex>,
        top_k: usize,
        document_id_field: impl Into<String>,
        concurrency: usize,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            index,
            top_k,
            document_id_field: document_id_field.into(),
            concurrency: concurrency.max(1),
            policy,
            metrics: None,
        }
    }

    /// Count every completed passage query in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Passages for every document in `scope`, grouped per document in scope order.
    ///
    /// Queries run up to the configured concurrency, but results are always concatenated in
    /// scope order. An empty scope issues no queries.
    pub async fn retrieve(
        &self,
        question: &str,
        scope: &[String],
    ) -> Result<Vec<PassageHit>, RetrievalError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = stream::iter(scope.iter().cloned().map(|document_id| async move {
            let filter = IndexFilter::equals(self.document_id_field.clone(), document_id.clone());
            let outcome = self.index.search(question, self.top_k, Some(&filter)).await;
            (document_id, outcome)
        }))
        .buffered(self.concurrency);

        let mut passages = Vec::new();
        let mut skipped = 0usize;
        while let Some((document_id, outcome)) = results.next().await {
            if let Some(metrics) = &self.metrics {
                metrics.record_passage_queries(1);
            }
            match outcome {
                Ok(records) => passages.extend(
                    records
                        .into_iter()
                        .map(|record| to_passage(&document_id, record)),
                ),
                Err(error) => match self.policy {
                    FailurePolicy::FailFast => return Err(error),
                    FailurePolicy::Isolate => {
                        skipped += 1;
                        tracing::warn!(
                            %document_id,
                            %error,
                            "Passage query failed; skipping document"
                        );
                    }
                },
            }
        }

        tracing::info!(
            index = self.index.name(),
            documents = scope.len(),
            skipped,
            passages = passages.len(),
            "Passages retrieved"
        );
        Ok(passages)
    }
}

fn to_passage(document_id: &str, record: IndexRecord) -> PassageHit {
    PassageHit {
        document_id: document_id.to_string(),
        score: record.score,
        text: record.content,
        metadata: record.metadata,
    }
}

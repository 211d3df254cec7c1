use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing question-answering activity.
#[derive(Default)]
pub struct PipelineMetrics {
    questions_received: AtomicU64,
    answers_generated: AtomicU64,
    fallback_answers: AtomicU64,
    failures: AtomicU64,
    passage_queries: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an incoming question.
    pub fn record_question(&self) {
        self.questions_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an answer produced by the generation model.
    pub fn record_generated(&self) {
        self.answers_generated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request answered with the no-documents fallback.
    pub fn record_fallback(&self) {
        self.fallback_answers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that terminated in failure.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the number of per-document passage queries issued for one request.
    pub fn record_passage_queries(&self, count: u64) {
        self.passage_queries.fetch_add(count, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            questions_received: self.questions_received.load(Ordering::Relaxed),
            answers_generated: self.answers_generated.load(Ordering::Relaxed),
            fallback_answers: self.fallback_answers.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            passage_queries: self.passage_queries.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Questions received since startup.
    pub questions_received: u64,
    /// Answers produced by the generation model.
    pub answers_generated: u64,
    /// Requests answered with the fallback string.
    pub fallback_answers: u64,
    /// Requests that failed.
    pub failures: u64,
    /// Per-document passage queries issued.
    pub passage_queries: u64,
}

//! Summary-level candidate retrieval.

use std::collections::BTreeSet;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::index::{IndexFilter, IndexRecord, RetrievalError, VectorIndex, scalar_text};

use super::types::{DocumentDetails, SummaryHit, link_label, name_label, year_label};

/// Payload key holding the board year of a document.
pub const YEAR_KEY: &str = "year";

/// Case-insensitive whole-word substitutions applied to questions before summary search.
#[derive(Debug, Clone)]
pub struct TermNormalizer {
    rules: Vec<(Regex, String)>,
}

impl TermNormalizer {
    /// A normalizer with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule replacing every case variant of the whole word `term` with `replacement`.
    pub fn with_rule(
        mut self,
        term: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let pattern = RegexBuilder::new(&format!(r"\b{}\b", regex::escape(term)))
            .case_insensitive(true)
            .build()?;
        self.rules.push((pattern, replacement.into()));
        Ok(self)
    }

    /// Apply every rule in order.
    pub fn normalize(&self, text: &str) -> String {
        self.rules
            .iter()
            .fold(text.to_string(), |current, (pattern, replacement)| {
                pattern
                    .replace_all(&current, regex::NoExpand(replacement))
                    .into_owned()
            })
    }
}

impl Default for TermNormalizer {
    /// The organization's name is canonicalized to `Aaltoes`.
    fn default() -> Self {
        let pattern = RegexBuilder::new(r"\baaltoes\b")
            .case_insensitive(true)
            .build()
            .expect("default normalization pattern is valid");
        Self {
            rules: vec![(pattern, "Aaltoes".to_string())],
        }
    }
}

/// Narrows candidate documents through the summary index.
pub struct SummaryRetriever {
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    document_id_field: String,
    normalizer: TermNormalizer,
}

impl SummaryRetriever {
    /// Bind the retriever to a summary index.
    pub fn new(
        index: Arc<dyn VectorIndex>,
        top_k: usize,
        document_id_field: impl Into<String>,
        normalizer: TermNormalizer,
    ) -> Self {
        Self {
            index,
            top_k,
            document_id_field: document_id_field.into(),
            normalizer,
        }
    }

    /// Swap the question normalizer.
    pub fn with_normalizer(mut self, normalizer: TermNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Top-`k` summaries for `question`, restricted to `years` when non-empty.
    ///
    /// Exactly one index call; its failure propagates.
    pub async fn retrieve(
        &self,
        question: &str,
        years: &BTreeSet<String>,
    ) -> Result<Vec<SummaryHit>, RetrievalError> {
        let query = self.normalizer.normalize(question);
        let filter = (!years.is_empty())
            .then(|| IndexFilter::any_of(YEAR_KEY, years.iter().cloned()));

        let records = self
            .index
            .search(&query, self.top_k, filter.as_ref())
            .await?;

        let hits: Vec<SummaryHit> = records
            .into_iter()
            .map(|record| self.to_hit(record))
            .collect();
        tracing::info!(
            index = self.index.name(),
            years = ?years,
            summaries = hits.len(),
            "Summaries retrieved"
        );
        Ok(hits)
    }

    /// Stored summary of one document, `None` when the index holds no summary for it.
    pub async fn document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentDetails>, RetrievalError> {
        let filter = IndexFilter::equals(self.document_id_field.clone(), document_id);
        let record = self.index.fetch(&filter, 1).await?.into_iter().next();
        tracing::info!(
            index = self.index.name(),
            document_id,
            found = record.is_some(),
            "Document summary looked up"
        );
        Ok(record.map(|record| DocumentDetails {
            id: document_id.to_string(),
            name: name_label(&record.metadata),
            year: year_label(&record.metadata),
            link: link_label(&record.metadata),
            summary: record.content,
        }))
    }

    fn to_hit(&self, record: IndexRecord) -> SummaryHit {
        let IndexRecord {
            score,
            content,
            metadata,
            ..
        } = record;
        let document_id = metadata
            .get(&self.document_id_field)
            .and_then(scalar_text)
            .filter(|id| !id.is_empty());
        SummaryHit {
            document_id,
            score,
            content,
            metadata,
        }
    }
}

//! Semantic-search seam between the pipeline and its vector indexes.
//!
//! The pipeline only sees [`VectorIndex`]: `search(query_text, top_k, filter)` returning ordered
//! records. [`QdrantIndex`] is the production implementation, embedding the query text and
//! querying one Qdrant collection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    embedding::{EmbeddingClient, EmbeddingClientError},
    qdrant::{self, QdrantError, QdrantService, QueryPoint},
};

/// Errors surfaced by a semantic-search call.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Embedding provider failed to return vectors for the query text.
    #[error("Failed to generate embeddings: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Qdrant search request returned an error response.
    #[error("Qdrant request failed: {0}")]
    Qdrant(#[from] QdrantError),
    /// Returned embedding dimension does not match configuration.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected embedding dimension configured on the server.
        expected: usize,
        /// Actual embedding dimension produced by the provider.
        actual: usize,
    },
    /// Embedding provider returned no vectors.
    #[error("Embedding provider returned no vectors for the query")]
    EmptyEmbedding,
    /// Any other backend failure reported by a custom index implementation.
    #[error("Index unavailable: {0}")]
    Unavailable(String),
}

/// How a filtered payload field must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatch {
    /// Field equals the value.
    Equals(String),
    /// Field is one of the values.
    AnyOf(Vec<String>),
}

/// Key/membership predicate restricting a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFilter {
    /// Payload field the predicate applies to.
    pub key: String,
    /// Expected value(s).
    pub matches: FieldMatch,
}

impl IndexFilter {
    /// Restrict results to records whose `key` equals `value`.
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            matches: FieldMatch::Equals(value.into()),
        }
    }

    /// Restrict results to records whose `key` is one of `values`.
    pub fn any_of<I, V>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            matches: FieldMatch::AnyOf(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Whether a metadata map satisfies this predicate.
    ///
    /// String and numeric payload values are compared by their textual form.
    pub fn accepts(&self, metadata: &Map<String, Value>) -> bool {
        let Some(actual) = metadata.get(&self.key).and_then(scalar_text) else {
            return false;
        };
        match &self.matches {
            FieldMatch::Equals(value) => *value == actual,
            FieldMatch::AnyOf(values) => values.iter().any(|value| *value == actual),
        }
    }
}

/// Render a scalar payload value as text; integral floats drop their fraction.
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(match number.as_f64() {
            Some(float) if number.is_f64() && float.fract() == 0.0 => format!("{}", float as i64),
            _ => number.to_string(),
        }),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// One ordered search result.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    /// Identifier of the stored vector.
    pub id: String,
    /// Similarity score reported by the index.
    pub score: f32,
    /// Searchable text of the record.
    pub content: String,
    /// Remaining payload fields, such as document id, year, and name.
    pub metadata: Map<String, Value>,
}

/// Interface implemented by semantic-search backends.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Return up to `top_k` records nearest to `query_text`, optionally filtered.
    async fn search(
        &self,
        query_text: &str,
        top_k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexRecord>, RetrievalError>;

    /// Return up to `limit` records matching `filter`, unranked.
    ///
    /// Indexes without a lookup path report [`RetrievalError::Unavailable`].
    async fn fetch(
        &self,
        _filter: &IndexFilter,
        _limit: usize,
    ) -> Result<Vec<IndexRecord>, RetrievalError> {
        Err(RetrievalError::Unavailable(format!(
            "{} does not support lookups by filter",
            self.name()
        )))
    }
}

/// [`VectorIndex`] backed by one Qdrant collection.
pub struct QdrantIndex {
    embedding_client: Arc<dyn EmbeddingClient + Send + Sync>,
    qdrant_service: Arc<QdrantService>,
    collection: String,
    content_field: String,
    dimension: usize,
}

impl QdrantIndex {
    /// Bind a collection to shared embedding and Qdrant handles.
    pub fn new(
        embedding_client: Arc<dyn EmbeddingClient + Send + Sync>,
        qdrant_service: Arc<QdrantService>,
        collection: impl Into<String>,
        content_field: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            embedding_client,
            qdrant_service,
            collection: collection.into(),
            content_field: content_field.into(),
            dimension,
        }
    }

    fn map_point(&self, point: QueryPoint) -> IndexRecord {
        let QueryPoint { id, score, payload } = point;
        let mut metadata = payload.unwrap_or_default();
        let content = match metadata.remove(&self.content_field) {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        IndexRecord {
            id: point_id_text(id),
            score,
            content,
            metadata,
        }
    }
}

fn point_id_text(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Object(mut map) => match map.remove("uuid") {
            Some(Value::String(uuid)) => uuid,
            Some(other) => other.to_string(),
            None => Value::Object(map).to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn name(&self) -> &str {
        &self.collection
    }

    async fn search(
        &self,
        query_text: &str,
        top_k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexRecord>, RetrievalError> {
        let mut vectors = self
            .embedding_client
            .generate_embeddings(vec![query_text.to_string()])
            .await?;
        let vector = vectors.pop().ok_or(RetrievalError::EmptyEmbedding)?;

        let actual = vector.len();
        if actual != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }

        let hits = self
            .qdrant_service
            .search_points(
                &self.collection,
                vector,
                filter.map(qdrant::build_filter),
                top_k,
            )
            .await?;

        tracing::debug!(
            collection = %self.collection,
            top_k,
            filtered = filter.is_some(),
            hits = hits.len(),
            "Index search completed"
        );

        Ok(hits.into_iter().map(|point| self.map_point(point)).collect())
    }

    async fn fetch(
        &self,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<IndexRecord>, RetrievalError> {
        let points = self
            .qdrant_service
            .scroll_points(&self.collection, qdrant::build_filter(filter), limit)
            .await?;
        Ok(points.into_iter().map(|point| self.map_point(point)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use reqwest::Client;
    use serde_json::json;

    struct FixedEmbedding(Vec<f32>);

    #[async_trait]
    impl EmbeddingClient for FixedEmbedding {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    fn index(server: &MockServer, vector: Vec<f32>, dimension: usize) -> QdrantIndex {
        let qdrant =
            QdrantService::new(Client::new(), &server.base_url(), None).expect("qdrant service");
        QdrantIndex::new(
            Arc::new(FixedEmbedding(vector)),
            Arc::new(qdrant),
            "my-doc-summaries",
            "text",
            dimension,
        )
    }

    #[tokio::test]
    async fn search_moves_content_out_of_metadata() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/my-doc-summaries/points/query")
                    .body_contains("\"limit\":15");
                then.status(200).json_body(json!({
                    "result": [
                        {
                            "id": "pt-1",
                            "score": 0.9,
                            "payload": {
                                "text": "Summary of the 2022 budget",
                                "id": "doc-1",
                                "year": 2022,
                                "name": "Budget 2022"
                            }
                        }
                    ]
                }));
            })
            .await;

        let records = index(&server, vec![0.5, 0.5], 2)
            .search("budget", 15, None)
            .await
            .expect("records");

        mock.assert();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, "pt-1");
        assert_eq!(record.content, "Summary of the 2022 budget");
        assert!(!record.metadata.contains_key("text"));
        assert_eq!(record.metadata["id"], json!("doc-1"));
        assert_eq!(record.metadata["year"], json!(2022));
    }

    #[tokio::test]
    async fn dimension_mismatch_skips_qdrant() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200).json_body(json!({ "result": [] }));
            })
            .await;

        let error = index(&server, vec![0.5], 3)
            .search("budget", 15, None)
            .await
            .expect_err("dimension mismatch");

        assert!(matches!(
            error,
            RetrievalError::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        ));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn fetch_scrolls_without_embedding() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/my-doc-summaries/points/scroll")
                    .body_contains("\"limit\":1");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [
                            {
                                "id": 3,
                                "payload": { "text": "Summary", "id": "doc-1", "name": "Minutes" }
                            }
                        ]
                    }
                }));
            })
            .await;

        // Mismatched dimension proves no embedding is requested.
        let records = index(&server, vec![0.5], 2)
            .fetch(&IndexFilter::equals("id", "doc-1"), 1)
            .await
            .expect("records");

        mock.assert();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "3");
        assert_eq!(records[0].content, "Summary");
        assert_eq!(records[0].metadata["name"], json!("Minutes"));
    }

    #[test]
    fn point_ids_render_as_text() {
        assert_eq!(point_id_text(json!("abc")), "abc");
        assert_eq!(point_id_text(json!(5)), "5");
        assert_eq!(point_id_text(json!({ "uuid": "u-1" })), "u-1");
        assert_eq!(point_id_text(Value::Null), "");
    }

    #[test]
    fn filter_matches_string_and_numeric_payloads() {
        let filter = IndexFilter::any_of("year", ["2022"]);
        let mut metadata = Map::new();
        metadata.insert("year".into(), json!(2022));
        assert!(filter.accepts(&metadata));
        metadata.insert("year".into(), json!(2022.0));
        assert!(filter.accepts(&metadata));
        metadata.insert("year".into(), json!("2022"));
        assert!(filter.accepts(&metadata));
        metadata.insert("year".into(), json!("2021"));
        assert!(!filter.accepts(&metadata));
        assert!(!filter.accepts(&Map::new()));
    }
}

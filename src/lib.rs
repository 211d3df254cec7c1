#![deny(missing_docs)]

//! Core library for the board document answer service.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Streaming answer generation providers.
pub mod generation;
/// Vector index abstraction over the summary and passage collections.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Question-answering metrics helpers.
pub mod metrics;
/// Retrieval and synthesis pipeline.
pub mod pipeline;
/// Qdrant vector store integration.
pub mod qdrant;

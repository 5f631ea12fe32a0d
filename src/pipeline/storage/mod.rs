pub mod types;
pub mod chunker;
pub mod embedder;
pub mod ollama;
pub mod backend;

pub use types::*;
pub use chunker::*;
pub use embedder::*;
pub use ollama::*;
pub use backend::*;

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::resilience::{CircuitOpenError, Classify, ErrorKind};

/// Failures of the artifact store collaborator. Classified as `Storage`, so
/// the default retry sets never retry them; breakers still count them.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact URI: {0}")]
    InvalidUri(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUri(_) => ErrorKind::InvalidInput,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            _ => ErrorKind::Storage,
        }
    }
}

/// Failures raised by an embedding model backend.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("Embedding service is not reachable at {0}")]
    Connection(String),

    #[error("Embedding request timed out after {0}s")]
    Timeout(u64),

    #[error("Embedding service returned error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("Embedding model not found: {0}")]
    NotFound(PathBuf),

    #[error("Embedding model initialization: {0}")]
    Init(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Embedding inference failed: {0}")]
    Inference(String),

    #[error("Malformed embedding response: {0}")]
    Response(String),
}

impl Classify for ModelError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            // Gateway-style statuses mean the service is flapping.
            Self::Http { status, .. } if matches!(status, 502..=504) => ErrorKind::Connection,
            // A malformed reply is the service's fault, not the caller's.
            Self::Http { .. }
            | Self::NotFound(_)
            | Self::Init(_)
            | Self::Inference(_)
            | Self::Response(_) => ErrorKind::Engine,
            Self::Tokenization(_) => ErrorKind::InvalidInput,
        }
    }
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Query text is empty")]
    EmptyQuery,

    #[error("{count} chunk(s) have missing or blank text (first indices: {indices:?})")]
    InvalidChunks { count: usize, indices: Vec<usize> },

    #[error("Embedding dimension mismatch: expected {expected}, model produces {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Embedding model failed: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl Classify for EmbeddingError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyQuery | Self::InvalidChunks { .. } => ErrorKind::InvalidInput,
            Self::DimensionMismatch { .. } | Self::ModelUnavailable(_) => ErrorKind::Structural,
            Self::Model(e) => e.kind(),
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
        }
    }
}

use serde::{Deserialize, Serialize};

use super::{ModelError, StorageError};

/// A contiguous piece of document text destined for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub content: String,
    pub chunk_index: usize,
    pub section_title: Option<String>,
    pub char_offset: usize,
}

/// Chunking strategy trait
pub trait Chunker {
    fn chunk(&self, text: &str) -> Vec<TextChunk>;
}

/// Anything that may carry chunk text. `None` means the text is missing or
/// not a string.
pub trait ChunkText {
    fn chunk_text(&self) -> Option<&str>;
}

impl ChunkText for TextChunk {
    fn chunk_text(&self) -> Option<&str> {
        Some(&self.content)
    }
}

/// JSON chunk records: `{"text": "...", ...}`.
impl ChunkText for serde_json::Value {
    fn chunk_text(&self) -> Option<&str> {
        self.get("text")?.as_str()
    }
}

impl ChunkText for String {
    fn chunk_text(&self) -> Option<&str> {
        Some(self)
    }
}

impl ChunkText for &str {
    fn chunk_text(&self) -> Option<&str> {
        Some(self)
    }
}

impl<T: ChunkText> ChunkText for Option<T> {
    fn chunk_text(&self) -> Option<&str> {
        self.as_ref()?.chunk_text()
    }
}

/// Embedding model abstraction
pub trait EmbeddingModel: Send + Sync {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Width of every vector this model produces.
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        self.embed_batch(&[text])?
            .pop()
            .ok_or_else(|| ModelError::Response("model returned no vector".into()))
    }
}

/// Allow `Box<dyn EmbeddingModel>` to be used as `&impl EmbeddingModel`.
impl EmbeddingModel for Box<dyn EmbeddingModel> {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError> {
        (**self).embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

/// What an artifact is, used as the first URI segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ExtractedImage,
    OcrText,
    Embeddings,
    SchemaReport,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractedImage => "extracted_image",
            Self::OcrText => "ocr_text",
            Self::Embeddings => "embeddings",
            Self::SchemaReport => "schema_report",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "extracted_image" => Some(Self::ExtractedImage),
            "ocr_text" => Some(Self::OcrText),
            "embeddings" => Some(Self::Embeddings),
            "schema_report" => Some(Self::SchemaReport),
            _ => None,
        }
    }
}

/// Where enrichment artifacts go. The pipeline only produces values; callers
/// decide what to persist through an implementation of this trait.
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` and return a URI that later calls accept.
    fn store(
        &self,
        kind: ArtifactKind,
        owning_id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<String, StorageError>;

    fn retrieve(&self, uri: &str) -> Result<Vec<u8>, StorageError>;

    fn exists(&self, uri: &str) -> Result<bool, StorageError>;

    /// Returns whether something was deleted.
    fn delete(&self, uri: &str) -> Result<bool, StorageError>;

    fn size(&self, uri: &str) -> Result<u64, StorageError>;
}

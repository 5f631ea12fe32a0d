use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::types::{ChunkText, EmbeddingModel};
use super::{EmbeddingError, ModelError};
use crate::pipeline::resilience::{CallGuard, Classify};

/// Vector width every model behind a [`ChunkEmbedder`] must produce.
pub const EMBEDDING_DIM: usize = 768;

/// How many invalid chunk indices an `InvalidChunks` error names.
const MAX_REPORTED_INDICES: usize = 5;

/// One row per input chunk, `EMBEDDING_DIM` columns, rows L2-normalized.
pub type EmbeddingMatrix = Array2<f32>;

/// A single row of an [`EmbeddingMatrix`] tied back to its chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEmbedding {
    pub vector: Vec<f32>,
    pub source_chunk_index: usize,
}

impl ChunkEmbedding {
    pub fn from_matrix(matrix: &EmbeddingMatrix) -> Vec<Self> {
        matrix
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| Self {
                vector: row.to_vec(),
                source_chunk_index: i,
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingBackend {
    Ollama {
        base_url: String,
        model: String,
        timeout_secs: u64,
    },
    /// Directory holding `model.onnx` and `tokenizer.json`.
    Onnx { model_dir: PathBuf },
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::Ollama {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub expected_dimension: usize,
    /// Texts sent to the model per call.
    pub batch_size: usize,
    pub backend: EmbeddingBackend,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            expected_dimension: EMBEDDING_DIM,
            batch_size: 32,
            backend: EmbeddingBackend::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Model loading
// ═══════════════════════════════════════════════════════════

/// Produces the model on first use.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn EmbeddingModel>, ModelError>;
}

impl<F> ModelLoader for F
where
    F: Fn() -> Result<Box<dyn EmbeddingModel>, ModelError> + Send + Sync,
{
    fn load(&self) -> Result<Box<dyn EmbeddingModel>, ModelError> {
        self()
    }
}

/// Box a closure as a [`ModelLoader`].
pub fn loader_fn<F>(load: F) -> Box<dyn ModelLoader>
where
    F: Fn() -> Result<Box<dyn EmbeddingModel>, ModelError> + Send + Sync + 'static,
{
    Box::new(load)
}

/// Loader for the backend named in config.
pub fn loader_for(backend: &EmbeddingBackend) -> Box<dyn ModelLoader> {
    match backend.clone() {
        EmbeddingBackend::Ollama {
            base_url,
            model,
            timeout_secs,
        } => loader_fn(move || {
            let embedder = super::ollama::OllamaEmbedder::connect(&base_url, &model, timeout_secs)?;
            Ok(Box::new(embedder) as Box<dyn EmbeddingModel>)
        }),
        EmbeddingBackend::Onnx { model_dir } => loader_fn(move || load_onnx(&model_dir)),
    }
}

#[cfg(feature = "onnx-embeddings")]
fn load_onnx(model_dir: &std::path::Path) -> Result<Box<dyn EmbeddingModel>, ModelError> {
    Ok(Box::new(OnnxEmbedder::load(model_dir)?))
}

#[cfg(not(feature = "onnx-embeddings"))]
fn load_onnx(model_dir: &std::path::Path) -> Result<Box<dyn EmbeddingModel>, ModelError> {
    Err(ModelError::Init(format!(
        "ONNX backend requested for {} but the onnx-embeddings feature is disabled",
        model_dir.display()
    )))
}

// ═══════════════════════════════════════════════════════════
// Chunk embedder
// ═══════════════════════════════════════════════════════════

/// Observable lifecycle of the underlying model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderState {
    Uninitialized,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
enum InitFailure {
    Dimension { expected: usize, actual: usize },
    Load(String),
}

impl InitFailure {
    fn to_error(&self) -> EmbeddingError {
        match self {
            Self::Dimension { expected, actual } => EmbeddingError::DimensionMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::Load(msg) => EmbeddingError::ModelUnavailable(msg.clone()),
        }
    }
}

enum ModelState {
    Uninitialized,
    Ready(Arc<dyn EmbeddingModel>),
    Failed(InitFailure),
}

/// Turns text chunks into a validated, L2-normalized embedding matrix.
///
/// The model is loaded lazily and its dimension checked once. A dimension
/// mismatch or a non-transient load failure leaves the embedder `Failed`
/// until [`ChunkEmbedder::reset`] is called; transient load failures
/// (connection, timeout) leave it `Uninitialized` so the next call tries again.
///
/// Loads are serialized: concurrent first callers wait for one load instead
/// of each starting their own. The state lock is never held across a load,
/// so `state()` and callers of an already-ready model do not block on it.
pub struct ChunkEmbedder {
    loader: Box<dyn ModelLoader>,
    expected_dimension: usize,
    batch_size: usize,
    state: Mutex<ModelState>,
    load_lock: Mutex<()>,
    guard: CallGuard,
}

impl ChunkEmbedder {
    pub fn new(loader: Box<dyn ModelLoader>, config: &EmbeddingConfig) -> Self {
        Self {
            loader,
            expected_dimension: config.expected_dimension,
            batch_size: config.batch_size.max(1),
            state: Mutex::new(ModelState::Uninitialized),
            load_lock: Mutex::new(()),
            guard: CallGuard::unguarded("embedding.model"),
        }
    }

    /// Route model load and inference through retry and a circuit breaker.
    pub fn with_guard(mut self, guard: CallGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn expected_dimension(&self) -> usize {
        self.expected_dimension
    }

    fn lock_state(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> EmbedderState {
        match &*self.lock_state() {
            ModelState::Uninitialized => EmbedderState::Uninitialized,
            ModelState::Ready(_) => EmbedderState::Ready,
            ModelState::Failed(_) => EmbedderState::Failed,
        }
    }

    /// Drop the model (or the recorded failure) so the next call reloads.
    pub fn reset(&self) {
        *self.lock_state() = ModelState::Uninitialized;
        tracing::info!("Embedder reset");
    }

    /// Load and validate the model now instead of on first use.
    pub fn initialize(&self) -> Result<(), EmbeddingError> {
        self.ready_model().map(|_| ())
    }

    /// The settled model or failure, if there is one.
    fn settled(&self) -> Option<Result<Arc<dyn EmbeddingModel>, EmbeddingError>> {
        match &*self.lock_state() {
            ModelState::Ready(model) => Some(Ok(Arc::clone(model))),
            ModelState::Failed(failure) => Some(Err(failure.to_error())),
            ModelState::Uninitialized => None,
        }
    }

    fn ready_model(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
        if let Some(settled) = self.settled() {
            return settled;
        }

        let _loading = self.load_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another caller may have finished loading while this one waited.
        if let Some(settled) = self.settled() {
            return settled;
        }

        let model = match self
            .guard
            .call(|| self.loader.load().map_err(EmbeddingError::from))
        {
            Ok(model) => model,
            Err(e) => {
                let kind = e.kind();
                if kind.is_transient() || matches!(e, EmbeddingError::CircuitOpen(_)) {
                    tracing::warn!(error = %e, "Embedding model load failed, will retry on next call");
                } else {
                    tracing::error!(error = %e, "Embedding model load failed");
                    *self.lock_state() = ModelState::Failed(InitFailure::Load(e.to_string()));
                }
                return Err(e);
            }
        };

        let actual = model.dimension();
        if actual != self.expected_dimension {
            tracing::error!(
                expected = self.expected_dimension,
                actual,
                "Embedding dimension mismatch, model dropped"
            );
            let failure = InitFailure::Dimension {
                expected: self.expected_dimension,
                actual,
            };
            let err = failure.to_error();
            *self.lock_state() = ModelState::Failed(failure);
            return Err(err);
        }

        tracing::info!(dimension = actual, "Embedding model ready");
        let model: Arc<dyn EmbeddingModel> = Arc::from(model);
        *self.lock_state() = ModelState::Ready(Arc::clone(&model));
        Ok(model)
    }

    /// Embed every chunk, all-or-nothing.
    pub fn embed_chunks<C: ChunkText>(&self, chunks: &[C]) -> Result<EmbeddingMatrix, EmbeddingError> {
        if chunks.is_empty() {
            return Ok(Array2::zeros((0, self.expected_dimension)));
        }

        let mut texts = Vec::with_capacity(chunks.len());
        let mut invalid = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            match chunk.chunk_text() {
                Some(text) if !text.trim().is_empty() => texts.push(text),
                _ => invalid.push(i),
            }
        }
        if !invalid.is_empty() {
            let count = invalid.len();
            invalid.truncate(MAX_REPORTED_INDICES);
            return Err(EmbeddingError::InvalidChunks {
                count,
                indices: invalid,
            });
        }

        self.embed_texts(&texts)
    }

    pub fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbeddingError> {
        if query.trim().is_empty() {
            return Err(EmbeddingError::EmptyQuery);
        }
        let matrix = self.embed_texts(&[query])?;
        Ok(matrix.row(0).to_vec())
    }

    fn embed_texts(&self, texts: &[&str]) -> Result<EmbeddingMatrix, EmbeddingError> {
        let model = self.ready_model()?;
        let dim = self.expected_dimension;
        let mut flat = Vec::with_capacity(texts.len() * dim);

        for batch in texts.chunks(self.batch_size) {
            let vectors = self
                .guard
                .call(|| model.embed_batch(batch).map_err(EmbeddingError::from))?;
            if vectors.len() != batch.len() {
                return Err(ModelError::Response(format!(
                    "model returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                ))
                .into());
            }
            for mut vector in vectors {
                if vector.len() != dim {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: dim,
                        actual: vector.len(),
                    });
                }
                l2_normalize(&mut vector);
                flat.extend_from_slice(&vector);
            }
        }

        tracing::debug!(rows = texts.len(), dimension = dim, "Chunks embedded");
        Array2::from_shape_vec((texts.len(), dim), flat)
            .map_err(|e| ModelError::Inference(e.to_string()).into())
    }
}

/// Scale to unit length. Zero vectors are left unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in vector.iter_mut() {
            *val /= norm;
        }
    }
}

// ═══════════════════════════════════════════════════════════
// ONNX Embedder (feature `onnx-embeddings`)
// ═══════════════════════════════════════════════════════════

#[cfg(feature = "onnx-embeddings")]
mod onnx {
    use super::{l2_normalize, EmbeddingModel, ModelError};
    use ort::session::Session;
    use std::path::Path;
    use std::sync::Mutex;

    /// Sentence-embedding model run through ONNX Runtime with mean pooling.
    ///
    /// Requires two files in the model directory:
    /// - `model.onnx`: the ONNX model weights
    /// - `tokenizer.json`: HuggingFace tokenizer definition
    ///
    /// `ort::Session::run` takes `&mut self`, hence the Mutex.
    pub struct OnnxEmbedder {
        session: Mutex<Session>,
        tokenizer: tokenizers::Tokenizer,
        dimension: usize,
    }

    impl OnnxEmbedder {
        /// Load from `model_dir` and probe the output width with one inference.
        pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
            let model_path = model_dir.join("model.onnx");
            let tokenizer_path = model_dir.join("tokenizer.json");

            if !model_path.exists() {
                return Err(ModelError::NotFound(model_path));
            }
            if !tokenizer_path.exists() {
                return Err(ModelError::NotFound(tokenizer_path));
            }

            let session = Session::builder()
                .map_err(|e: ort::Error| ModelError::Init(e.to_string()))?
                .with_intra_threads(2)
                .map_err(|e: ort::Error| ModelError::Init(e.to_string()))?
                .commit_from_file(&model_path)
                .map_err(|e: ort::Error| ModelError::Init(format!("ONNX load failed: {e}")))?;

            let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| ModelError::Init(format!("Tokenizer load failed: {e}")))?;

            let mut embedder = Self {
                session: Mutex::new(session),
                tokenizer,
                dimension: 0,
            };
            embedder.dimension = embedder.infer("dimension probe")?.len();

            tracing::info!(
                model_dir = %model_dir.display(),
                dimension = embedder.dimension,
                "ONNX embedder loaded"
            );
            Ok(embedder)
        }

        fn infer(&self, text: &str) -> Result<Vec<f32>, ModelError> {
            use ort::value::TensorRef;

            let encoding = self
                .tokenizer
                .encode(text, true)
                .map_err(|e| ModelError::Tokenization(e.to_string()))?;

            let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
            let attention_mask: Vec<i64> = encoding
                .get_attention_mask()
                .iter()
                .map(|&m| m as i64)
                .collect();
            let token_type_ids: Vec<i64> = encoding
                .get_type_ids()
                .iter()
                .map(|&t| t as i64)
                .collect();

            let seq_len = input_ids.len();
            let inference = |e: &dyn std::fmt::Display| ModelError::Inference(e.to_string());

            let ids_array = ndarray::Array2::from_shape_vec((1, seq_len), input_ids)
                .map_err(|e| inference(&e))?;
            let mask_array = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
                .map_err(|e| inference(&e))?;
            let type_array = ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids)
                .map_err(|e| inference(&e))?;

            let ids_tensor = TensorRef::from_array_view(&ids_array).map_err(|e| inference(&e))?;
            let mask_tensor = TensorRef::from_array_view(&mask_array).map_err(|e| inference(&e))?;
            let type_tensor = TensorRef::from_array_view(&type_array).map_err(|e| inference(&e))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| ModelError::Inference("Session lock poisoned".to_string()))?;

            let outputs = session
                .run(ort::inputs![ids_tensor, mask_tensor, type_tensor])
                .map_err(|e| ModelError::Inference(format!("ONNX inference failed: {e}")))?;

            // Output shape: [1, seq_len, dim]
            let (shape, output_data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::Response(format!("Output extraction: {e}")))?;

            if shape.len() != 3 || shape[2] <= 0 {
                return Err(ModelError::Response(format!(
                    "Unexpected output shape: {shape:?}, expected [1, {seq_len}, dim]"
                )));
            }
            let dim = shape[2] as usize;

            let mut pooled = vec![0.0f32; dim];
            let mut mask_sum = 0.0f32;

            for (token_idx, &mask_val_i64) in attention_mask.iter().enumerate().take(seq_len) {
                let mask_val = mask_val_i64 as f32;
                mask_sum += mask_val;
                let offset = token_idx * dim;
                for (dim_idx, p) in pooled.iter_mut().enumerate() {
                    *p += output_data[offset + dim_idx] * mask_val;
                }
            }

            if mask_sum > 0.0 {
                for val in &mut pooled {
                    *val /= mask_sum;
                }
            }

            l2_normalize(&mut pooled);
            Ok(pooled)
        }
    }

    impl EmbeddingModel for OnnxEmbedder {
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError> {
            texts.iter().map(|t| self.infer(t)).collect()
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }
}

#[cfg(feature = "onnx-embeddings")]
pub use onnx::OnnxEmbedder;

// ═══════════════════════════════════════════════════════════
// Mock embedder
// ═══════════════════════════════════════════════════════════

/// Mock embedding model for testing. Produces deterministic vectors.
pub struct MockEmbedder {
    dimension: usize,
    /// Width of returned vectors; differs from `dimension` to simulate a
    /// model that lies about its output.
    output_width: usize,
    failure: Option<ModelError>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(EMBEDDING_DIM)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            output_width: dimension,
            failure: None,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_output_width(mut self, width: usize) -> Self {
        self.output_width = width;
        self
    }

    /// Every `embed_batch` call fails with `error`.
    pub fn failing(error: ModelError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for MockEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(texts
            .iter()
            .map(|t| deterministic_vector(t, self.output_width))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic, not normalized: `ChunkEmbedder` owns normalization.
fn deterministic_vector(text: &str, dim: usize) -> Vec<f32> {
    let bytes = text.as_bytes();
    (0..dim)
        .map(|i| {
            let byte_idx = i % bytes.len().max(1);
            (bytes.get(byte_idx).copied().unwrap_or(0) as f32 + i as f32) / 255.0
        })
        .collect()
}

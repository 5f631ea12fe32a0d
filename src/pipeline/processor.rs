//! Ingestion orchestrator.
//!
//! Single entry point that routes discovered files through the enrichment
//! stages:
//! - images: text-presence gate → OCR
//! - documents: text → chunks → embeddings, plus embedded images → gate → OCR
//! - JSON payloads: schema analyzer
//! - videos: counted as skipped
//!
//! Engines are injected (`OcrEngine`, `ModelLoader`, `ArtifactStore`) so the
//! orchestrator stays fully testable with mock implementations.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use image::DynamicImage;
use ndarray::Array2;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::discovery::{
    DiscoveryError, FileCategory, FileDescriptor, FileScanner, ScanSummary,
};
use crate::pipeline::extraction::{
    decode_image, encode_png, extract_text_from_bytes, validate_image_bytes, DocumentText,
    EmbeddedImageExtractor, ExtractionError, OcrEngine, OcrExtractor, OcrResult, TextGateResult,
    TextPresenceGate,
};
use crate::pipeline::resilience::{
    run_with_fallback_when, BreakerRegistry, CallGuard, CircuitBreakerState, Classify, ErrorKind,
};
use crate::pipeline::schema::{SchemaAnalyzer, SchemaReport};
use crate::pipeline::storage::{
    loader_for, ArtifactKind, ArtifactStore, ChunkEmbedder, ChunkEmbedding, Chunker,
    EmbeddingError, ModelLoader, SectionChunker, StorageError, TextChunk,
};
use crate::pipeline_config::{ConfigError, PipelineConfig};

/// Document formats that may carry embedded images.
const CONTAINER_EXTENSIONS: &[&str] = &["pdf", "docx", "pptx", "xlsx", "odt"];

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while processing one file or a tree.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {message}")]
    Json { path: PathBuf, message: String },

    #[error("Cannot serialize {what}: {message}")]
    Serialize { what: &'static str, message: String },
}

impl Classify for ProcessingError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Discovery(e) => e.kind(),
            Self::Extraction(e) => e.kind(),
            Self::Embedding(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Config(_) => ErrorKind::InvalidInput,
            Self::Read { .. } => ErrorKind::Storage,
            Self::Json { .. } => ErrorKind::Decode,
            Self::Serialize { .. } => ErrorKind::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// What happened to one discovered file.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub asset_id: Uuid,
    pub relative_path: String,
    pub category: FileCategory,
    pub enrichment: Enrichment,
    /// URIs of artifacts written to the store.
    pub artifacts: Vec<String>,
    /// Artifacts produced but not written (store failure or open breaker).
    pub unsaved_artifacts: usize,
}

impl ItemOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self.enrichment, Enrichment::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Enrichment {
    Image(ImageEnrichment),
    Document(DocumentEnrichment),
    Json(JsonEnrichment),
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageEnrichment {
    pub gate: TextGateResult,
    /// Present only when the gate decided there is text.
    pub ocr: Option<OcrResult>,
}

/// OCR output for an image found inside a document.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddedImageText {
    pub source: String,
    pub page_number: Option<u32>,
    pub ocr: OcrResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentEnrichment {
    pub page_count: usize,
    pub text_length: usize,
    pub chunks: Vec<TextChunk>,
    pub embeddings: Vec<ChunkEmbedding>,
    /// Embedding failed and the document was kept without vectors.
    pub embeddings_degraded: bool,
    pub embedded_images: usize,
    /// Embedded images that could not be decoded or read.
    pub skipped_images: usize,
    pub image_text: Vec<EmbeddedImageText>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonEnrichment {
    pub documents_seen: usize,
    /// Documents folded into the schema statistics (sample cap applies).
    pub documents_analyzed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub relative_path: String,
    pub kind: ErrorKind,
    pub error: String,
}

/// Batch summary returned by [`IngestionPipeline::process_tree`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub batch_id: Uuid,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scan: ScanSummary,
    pub items: Vec<ItemOutcome>,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
    /// Present when at least one JSON document was analyzed.
    pub schema: Option<SchemaReport>,
    pub schema_uri: Option<String>,
    pub breakers: Vec<CircuitBreakerState>,
}

#[derive(Default)]
struct ArtifactLog {
    uris: Vec<String>,
    unsaved: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct IngestionPipeline {
    scanner: FileScanner,
    gate: TextPresenceGate,
    ocr: OcrExtractor,
    embedded: EmbeddedImageExtractor,
    chunker: SectionChunker,
    embedder: ChunkEmbedder,
    analyzer: Mutex<SchemaAnalyzer>,
    registry: Arc<BreakerRegistry>,
    store: Option<Arc<dyn ArtifactStore>>,
    storage_guard: CallGuard,
}

impl IngestionPipeline {
    /// Wire every stage from `config`. OCR and the gate share the engine and
    /// its breaker; every guard comes from `registry`.
    pub fn new(
        config: &PipelineConfig,
        ocr_engine: Arc<dyn OcrEngine>,
        loader: Box<dyn ModelLoader>,
        registry: Arc<BreakerRegistry>,
    ) -> Self {
        let resilience = &config.resilience;
        Self {
            scanner: FileScanner::new(config.scan.clone()),
            gate: TextPresenceGate::new(Arc::clone(&ocr_engine), config.text_gate.clone())
                .with_guard(resilience.gate_guard(&registry)),
            ocr: OcrExtractor::new(ocr_engine, config.ocr.clone())
                .with_guard(resilience.ocr_guard(&registry)),
            embedded: EmbeddedImageExtractor::new(config.embedded.clone()),
            chunker: SectionChunker::new(config.chunking.clone()),
            embedder: ChunkEmbedder::new(loader, &config.embedding)
                .with_guard(resilience.embedding_guard(&registry)),
            analyzer: Mutex::new(SchemaAnalyzer::new(config.schema.clone())),
            storage_guard: resilience.storage_guard(&registry),
            registry,
            store: None,
        }
    }

    /// Persist OCR text, embeddings, extracted images and schema reports.
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn embedder(&self) -> &ChunkEmbedder {
        &self.embedder
    }

    pub fn registry(&self) -> &BreakerRegistry {
        &self.registry
    }

    fn lock_analyzer(&self) -> MutexGuard<'_, SchemaAnalyzer> {
        self.analyzer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schema statistics accumulated since the last tree run or reset.
    pub fn schema_summary(&self) -> SchemaReport {
        self.lock_analyzer().summary()
    }

    pub fn reset_schema(&self) {
        self.lock_analyzer().reset();
    }

    /// Route one descriptor to its stages.
    pub fn process_file(&self, descriptor: &FileDescriptor) -> Result<ItemOutcome, ProcessingError> {
        let asset_id = Uuid::new_v4();
        let mut log = ArtifactLog::default();

        tracing::debug!(
            path = %descriptor.relative_path.display(),
            category = descriptor.category.as_str(),
            "Processing item"
        );

        let enrichment = match descriptor.category {
            FileCategory::Image => {
                Enrichment::Image(self.enrich_image(descriptor, &asset_id, &mut log)?)
            }
            FileCategory::Document => {
                Enrichment::Document(self.enrich_document(descriptor, &asset_id, &mut log)?)
            }
            FileCategory::Json => Enrichment::Json(self.enrich_json(descriptor)?),
            FileCategory::Video => Enrichment::Skipped {
                reason: "video content is not enriched".into(),
            },
        };

        Ok(ItemOutcome {
            asset_id,
            relative_path: descriptor.relative_str(),
            category: descriptor.category,
            enrichment,
            artifacts: log.uris,
            unsaved_artifacts: log.unsaved,
        })
    }

    /// Discover everything under `root` and process it item by item.
    ///
    /// A failing item is logged and counted; it never aborts the batch. Each
    /// run starts a fresh schema sample so reports compare across batches.
    pub fn process_tree(&self, root: &Path) -> Result<IngestionReport, ProcessingError> {
        let started_at = Utc::now();
        let batch_id = Uuid::new_v4();
        let scan = self.scanner.scan_all(root)?;
        self.reset_schema();

        let mut items = Vec::with_capacity(scan.files.len());
        let mut failures = Vec::new();
        let (mut processed, mut skipped) = (0, 0);

        for descriptor in &scan.files {
            match self.process_file(descriptor) {
                Ok(item) => {
                    if item.is_skipped() {
                        skipped += 1;
                    } else {
                        processed += 1;
                    }
                    items.push(item);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %descriptor.relative_path.display(),
                        kind = ?e.kind(),
                        error = %e,
                        "Item failed, continuing batch"
                    );
                    failures.push(ItemFailure {
                        relative_path: descriptor.relative_str(),
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let (schema, schema_uri) = self.finish_schema(&batch_id)?;
        let failed = failures.len();

        tracing::info!(
            root = %root.display(),
            batch_id = %batch_id,
            processed,
            skipped,
            failed,
            ignored = scan.summary.ignored,
            "Ingestion batch complete"
        );

        Ok(IngestionReport {
            batch_id,
            root: root.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            scan: scan.summary,
            items,
            processed,
            skipped,
            failed,
            failures,
            schema,
            schema_uri,
            breakers: self.registry.snapshot(),
        })
    }

    fn finish_schema(
        &self,
        batch_id: &Uuid,
    ) -> Result<(Option<SchemaReport>, Option<String>), ProcessingError> {
        let report = {
            let analyzer = self.lock_analyzer();
            if analyzer.documents_analyzed() == 0 {
                return Ok((None, None));
            }
            analyzer.summary()
        };

        let json = serde_json::to_vec_pretty(&report).map_err(|e| ProcessingError::Serialize {
            what: "schema report",
            message: e.to_string(),
        })?;
        let mut log = ArtifactLog::default();
        self.persist(
            batch_id,
            ArtifactKind::SchemaReport,
            &json,
            "schema_report.json",
            &mut log,
        );
        Ok((Some(report), log.uris.pop()))
    }

    // -- Stages ---------------------------------------------------------------

    /// Gate first; OCR only when the gate sees text.
    fn read_text(
        &self,
        image: &DynamicImage,
    ) -> Result<(TextGateResult, Option<OcrResult>), ExtractionError> {
        let gate = self.gate.detect(image)?;
        let ocr = if gate.has_text {
            Some(self.ocr.extract(image)?)
        } else {
            None
        };
        Ok((gate, ocr))
    }

    fn enrich_image(
        &self,
        descriptor: &FileDescriptor,
        asset_id: &Uuid,
        log: &mut ArtifactLog,
    ) -> Result<ImageEnrichment, ProcessingError> {
        let bytes = read_file(&descriptor.absolute_path)?;
        validate_image_bytes(&bytes)?;
        let image = decode_image(&bytes)?;

        let (gate, ocr) = self.read_text(&image)?;
        if let Some(result) = &ocr {
            self.persist(asset_id, ArtifactKind::OcrText, result.text.as_bytes(), "ocr.txt", log);
        }
        Ok(ImageEnrichment { gate, ocr })
    }

    fn enrich_document(
        &self,
        descriptor: &FileDescriptor,
        asset_id: &Uuid,
        log: &mut ArtifactLog,
    ) -> Result<DocumentEnrichment, ProcessingError> {
        let path = &descriptor.absolute_path;
        let bytes = read_file(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let text = match extract_text_from_bytes(&bytes, &extension) {
            Ok(text) => text,
            Err(ExtractionError::UnsupportedFormat(reason)) => {
                tracing::debug!(path = %path.display(), reason = %reason, "Text layer not extracted");
                DocumentText { pages: Vec::new() }
            }
            Err(e) => return Err(e.into()),
        };
        let full_text = text.full_text();
        let chunks = self.chunker.chunk(&full_text);

        // Outages degrade to no embeddings; a misconfigured model fails the item.
        let embedded = run_with_fallback_when(
            "embed_chunks",
            || self.embedder.embed_chunks(&chunks),
            |e: &EmbeddingError| e.kind().is_outage(),
            || Ok(Array2::zeros((0, self.embedder.expected_dimension()))),
        )?;
        let embeddings = ChunkEmbedding::from_matrix(&embedded.value);
        if !embeddings.is_empty() {
            let json = serde_json::to_vec(&embeddings).map_err(|e| ProcessingError::Serialize {
                what: "embeddings",
                message: e.to_string(),
            })?;
            self.persist(asset_id, ArtifactKind::Embeddings, &json, "embeddings.json", log);
        }

        let mut enrichment = DocumentEnrichment {
            page_count: text.pages.len(),
            text_length: full_text.chars().count(),
            chunks,
            embeddings,
            embeddings_degraded: embedded.used_fallback,
            embedded_images: 0,
            skipped_images: 0,
            image_text: Vec::new(),
        };

        if CONTAINER_EXTENSIONS.contains(&extension.as_str()) {
            self.enrich_embedded_images(&bytes, asset_id, log, &mut enrichment);
        }

        tracing::info!(
            path = %descriptor.relative_path.display(),
            pages = enrichment.page_count,
            chunks = enrichment.chunks.len(),
            embedded_images = enrichment.embedded_images,
            degraded = enrichment.embeddings_degraded,
            "Document enriched"
        );
        Ok(enrichment)
    }

    /// Each embedded image re-enters the gate/OCR path; failures only skip
    /// that image.
    fn enrich_embedded_images(
        &self,
        bytes: &[u8],
        asset_id: &Uuid,
        log: &mut ArtifactLog,
        enrichment: &mut DocumentEnrichment,
    ) {
        let harvest = self.embedded.extract_images(bytes);
        if harvest.document_failed {
            tracing::warn!(asset_id = %asset_id, "Embedded images unavailable, container unreadable");
        }
        enrichment.embedded_images = harvest.len();
        enrichment.skipped_images = harvest.skipped;

        for (i, extracted) in harvest.images.iter().enumerate() {
            if self.store.is_some() {
                match encode_png(&extracted.image) {
                    Ok(png) => self.persist(
                        asset_id,
                        ArtifactKind::ExtractedImage,
                        &png,
                        &format!("image-{:03}.png", i + 1),
                        log,
                    ),
                    Err(e) => {
                        tracing::warn!(source = %extracted.source, error = %e, "Cannot encode embedded image");
                        log.unsaved += 1;
                    }
                }
            }

            match self.read_text(&extracted.image) {
                Ok((_, Some(ocr))) => enrichment.image_text.push(EmbeddedImageText {
                    source: extracted.source.clone(),
                    page_number: extracted.page_number,
                    ocr,
                }),
                Ok((_, None)) => {}
                Err(e) => {
                    tracing::warn!(source = %extracted.source, error = %e, "Embedded image skipped");
                    enrichment.skipped_images += 1;
                }
            }
        }
    }

    /// A JSON file holds one object or an array of objects.
    fn enrich_json(&self, descriptor: &FileDescriptor) -> Result<JsonEnrichment, ProcessingError> {
        let path = &descriptor.absolute_path;
        let bytes = read_file(path)?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| ProcessingError::Json {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let mut analyzer = self.lock_analyzer();
        let (documents_seen, documents_analyzed) = match &value {
            Value::Array(items) => (items.len(), analyzer.analyze_batch(items)),
            single => (1, usize::from(analyzer.analyze(single))),
        };

        tracing::debug!(
            path = %descriptor.relative_path.display(),
            documents_seen,
            documents_analyzed,
            "JSON payload analyzed"
        );
        Ok(JsonEnrichment {
            documents_seen,
            documents_analyzed,
        })
    }

    /// Store an artifact through the storage guard. Failures are logged and
    /// counted, never propagated.
    fn persist(
        &self,
        owner: &Uuid,
        kind: ArtifactKind,
        bytes: &[u8],
        filename: &str,
        log: &mut ArtifactLog,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let owner = owner.to_string();
        match self
            .storage_guard
            .call(|| store.store(kind, &owner, bytes, filename))
        {
            Ok(uri) => log.uris.push(uri),
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), owner = %owner, error = %e, "Artifact not persisted");
                log.unsaved += 1;
            }
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ProcessingError> {
    std::fs::read(path).map_err(|source| ProcessingError::Read {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build an `IngestionPipeline` with production implementations.
///
/// - OCR: `TesseractEngine` (feature-gated) or an engine that never sees text
/// - Embeddings: the backend named in `config.embedding.backend`, loaded lazily
pub fn build_pipeline(config: &PipelineConfig) -> Result<IngestionPipeline, ProcessingError> {
    config.validate()?;
    let registry = Arc::new(config.resilience.registry());
    let ocr = build_ocr_engine(config)?;
    let loader = loader_for(&config.embedding.backend);
    Ok(IngestionPipeline::new(config, ocr, loader, registry))
}

/// Build the OCR engine, respecting feature flags.
fn build_ocr_engine(config: &PipelineConfig) -> Result<Arc<dyn OcrEngine>, ProcessingError> {
    #[cfg(feature = "ocr")]
    {
        use crate::pipeline::extraction::TesseractEngine;

        if let Some(tessdata) = config.ocr.tessdata_dir.clone().or_else(find_tessdata_dir) {
            let engine = TesseractEngine::new(&tessdata)?;
            tracing::info!(tessdata = %tessdata.display(), "Tesseract OCR initialized");
            return Ok(Arc::new(engine));
        }
        tracing::info!("No tessdata directory found, using libtesseract's built-in path");
        Ok(Arc::new(TesseractEngine::system_default()))
    }

    #[cfg(not(feature = "ocr"))]
    {
        let _ = config;
        tracing::info!("Built without OCR, images will report no text");
        Ok(Arc::new(crate::pipeline::extraction::MockOcrEngine::new(Vec::new())))
    }
}

/// Locate tessdata directory from environment or system paths.
#[cfg(feature = "ocr")]
fn find_tessdata_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TESSDATA_PREFIX") {
        let p = PathBuf::from(&path);
        if p.join("eng.traineddata").exists() {
            return Some(p);
        }
    }

    let candidates = [
        "/usr/share/tesseract-ocr/5/tessdata",
        "/usr/share/tesseract-ocr/4.00/tessdata",
        "/usr/share/tessdata",
        "/usr/local/share/tessdata",
        "/opt/homebrew/share/tessdata",
    ];

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.join("eng.traineddata").exists())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

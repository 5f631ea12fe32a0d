use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{DynamicImage, ImageOutputFormat};
use serde::{Deserialize, Serialize};

use super::types::{BoundingBox, OcrEngine, OcrResult, RawConfidence, RawToken};
use super::ExtractionError;
use crate::pipeline::resilience::CallGuard;

/// Maximum encoded image size accepted for decoding.
/// Prevents OOM on corrupt/adversarial files.
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

/// Smallest plausible encoded image (a minimal PNG is ~67 bytes).
const MIN_IMAGE_BYTES: usize = 67;

/// Tesseract page segmentation mode: assume a single uniform block of text.
pub const PSM_SINGLE_BLOCK: &str = "6";

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Tesseract language code(s), e.g. "eng" or "eng+fra".
    pub language: String,
    /// Tokens at or above this confidence (0-100) become words and boxes.
    pub acceptance_threshold: f32,
    /// Directory holding `*.traineddata`; `None` uses the system default.
    pub tessdata_dir: Option<PathBuf>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            acceptance_threshold: 60.0,
            tessdata_dir: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Engines
// ═══════════════════════════════════════════════════════════

/// Tesseract OCR engine.
/// Only available when compiled with the `ocr` feature flag.
#[cfg(feature = "ocr")]
pub struct TesseractEngine {
    tessdata_dir: Option<PathBuf>,
}

#[cfg(feature = "ocr")]
impl TesseractEngine {
    /// Initialize with an explicit tessdata directory, which must contain at
    /// least `eng.traineddata`.
    pub fn new(tessdata_dir: &std::path::Path) -> Result<Self, ExtractionError> {
        if !tessdata_dir.join("eng.traineddata").exists() {
            return Err(ExtractionError::TessdataNotFound(tessdata_dir.to_path_buf()));
        }
        tracing::info!(tessdata = %tessdata_dir.display(), "Tesseract engine ready");
        Ok(Self {
            tessdata_dir: Some(tessdata_dir.to_path_buf()),
        })
    }

    /// Use whatever tessdata location libtesseract was built with.
    pub fn system_default() -> Self {
        Self { tessdata_dir: None }
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for TesseractEngine {
    fn recognize(
        &self,
        image: &DynamicImage,
        language: &str,
    ) -> Result<Vec<RawToken>, ExtractionError> {
        let png = encode_png(image)?;

        let datapath = match &self.tessdata_dir {
            Some(dir) => Some(
                dir.to_str()
                    .ok_or_else(|| ExtractionError::OcrInit("Invalid tessdata path".into()))?,
            ),
            None => None,
        };

        let tess = tesseract::Tesseract::new(datapath, Some(language))
            .map_err(|e| ExtractionError::OcrInit(format!("{e:?}")))?;

        let tess = tess
            .set_variable("tessedit_pageseg_mode", PSM_SINGLE_BLOCK)
            .map_err(|e| ExtractionError::OcrConfig(format!("{e:?}")))?;

        let mut tess = tess
            .set_image_from_mem(&png)
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        let tsv = tess
            .get_tsv_text(0)
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        Ok(parse_tsv_tokens(&tsv))
    }
}

/// Mock OCR engine for unit testing without Tesseract.
///
/// Returns the configured tokens (or failure) and counts invocations.
pub struct MockOcrEngine {
    tokens: Vec<RawToken>,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl MockOcrEngine {
    pub fn new(tokens: Vec<RawToken>) -> Self {
        Self {
            tokens,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Engine whose every call fails with `OcrProcessing(message)`.
    pub fn failing(message: &str) -> Self {
        Self {
            tokens: Vec::new(),
            failure: Some(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Tokens laid out left to right, one per word, all with `confidence`.
    pub fn with_words(text: &str, confidence: f64) -> Self {
        let tokens = text
            .split_whitespace()
            .enumerate()
            .map(|(i, w)| RawToken {
                text: w.to_string(),
                left: i as i32 * 60,
                top: 10,
                width: 50,
                height: 20,
                confidence: RawConfidence::Number(confidence),
            })
            .collect();
        Self::new(tokens)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for MockOcrEngine {
    fn recognize(
        &self,
        _image: &DynamicImage,
        _language: &str,
    ) -> Result<Vec<RawToken>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(msg) => Err(ExtractionError::OcrProcessing(msg.clone())),
            None => Ok(self.tokens.clone()),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// TSV parsing
// ═══════════════════════════════════════════════════════════

/// Parse Tesseract TSV output into raw word tokens.
/// TSV columns: level page_num block_num par_num line_num word_num left top width height conf text
/// Level 5 = individual word entries. Confidence is kept as the engine wrote it.
pub fn parse_tsv_tokens(tsv: &str) -> Vec<RawToken> {
    let mut tokens = Vec::new();

    for line in tsv.lines().skip(1) {
        // Skip header row
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 11 {
            continue;
        }

        // Level 5 = word
        match fields[0].trim().parse::<i32>() {
            Ok(5) => {}
            _ => continue,
        }

        let coord = |i: usize| fields[i].trim().parse::<i32>().unwrap_or(0);

        tokens.push(RawToken {
            text: fields.get(11).copied().unwrap_or("").to_string(),
            left: coord(6),
            top: coord(7),
            width: coord(8),
            height: coord(9),
            confidence: RawConfidence::Text(fields[10].trim().to_string()),
        });
    }

    tokens
}

// ═══════════════════════════════════════════════════════════
// Token accounting
// ═══════════════════════════════════════════════════════════

/// A token that takes part in the confidence mean.
pub(crate) struct CountedToken<'a> {
    pub token: &'a RawToken,
    pub word: &'a str,
    /// Clamped to 0-100; unreliable detections are 0.
    pub confidence: f32,
    pub reliable: bool,
}

/// Drop blank tokens and tokens with unparsable confidence; map the
/// unreliable sentinel (any negative value) to 0.
pub(crate) fn counted_tokens(tokens: &[RawToken]) -> Vec<CountedToken<'_>> {
    tokens
        .iter()
        .filter_map(|token| {
            let word = token.text.trim();
            if word.is_empty() {
                return None;
            }
            let raw = token.confidence.value()?;
            let reliable = raw >= 0.0;
            let confidence = if reliable { raw.min(100.0) } else { 0.0 };
            Some(CountedToken {
                token,
                word,
                confidence,
                reliable,
            })
        })
        .collect()
}

pub(crate) fn mean_confidence(counted: &[CountedToken<'_>]) -> f32 {
    if counted.is_empty() {
        return 0.0;
    }
    let sum: f32 = counted.iter().map(|t| t.confidence).sum();
    (sum / counted.len() as f32).clamp(0.0, 100.0)
}

/// Build an [`OcrResult`] from raw engine tokens.
pub fn build_ocr_result(tokens: &[RawToken], acceptance_threshold: f32, language: &str) -> OcrResult {
    let counted = counted_tokens(tokens);

    let bounding_boxes: Vec<BoundingBox> = counted
        .iter()
        .filter(|t| t.reliable && t.confidence >= acceptance_threshold)
        .map(|t| BoundingBox {
            word: t.word.to_string(),
            x: t.token.left,
            y: t.token.top,
            width: t.token.width,
            height: t.token.height,
            confidence: t.confidence,
        })
        .collect();

    let text = bounding_boxes
        .iter()
        .map(|b| b.word.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    OcrResult {
        text,
        confidence: mean_confidence(&counted),
        word_count: bounding_boxes.len(),
        bounding_boxes,
        language: language.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════

/// OCR text, boxes, and confidence for single images or batches.
pub struct OcrExtractor {
    engine: Arc<dyn OcrEngine>,
    config: OcrConfig,
    guard: CallGuard,
}

impl OcrExtractor {
    pub fn new(engine: Arc<dyn OcrEngine>, config: OcrConfig) -> Self {
        Self {
            engine,
            config,
            guard: CallGuard::unguarded("ocr.extract"),
        }
    }

    /// Route engine calls through retry and a circuit breaker.
    pub fn with_guard(mut self, guard: CallGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    /// Engine failure propagates; there is no partial result for one image.
    pub fn extract(&self, image: &DynamicImage) -> Result<OcrResult, ExtractionError> {
        let tokens = self
            .guard
            .call(|| self.engine.recognize(image, &self.config.language))?;
        let result = build_ocr_result(
            &tokens,
            self.config.acceptance_threshold,
            &self.config.language,
        );
        tracing::debug!(
            words = result.word_count,
            confidence = result.confidence,
            "OCR extraction complete"
        );
        Ok(result)
    }

    pub fn extract_bytes(&self, bytes: &[u8]) -> Result<OcrResult, ExtractionError> {
        let image = decode_image(bytes)?;
        self.extract(&image)
    }

    /// Order-preserving; a failing image yields an empty result.
    pub fn extract_batch(&self, images: &[DynamicImage]) -> Vec<OcrResult> {
        images
            .iter()
            .enumerate()
            .map(|(index, image)| match self.extract(image) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(index, error = %e, "OCR failed for batch item, using empty result");
                    OcrResult::empty(&self.config.language)
                }
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════
// Image helpers
// ═══════════════════════════════════════════════════════════

/// Validate image bytes before decoding.
/// Rejects clearly invalid input before decoding.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), ExtractionError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ExtractionError::ImageDecode(
            "Image data too small to be valid".into(),
        ));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ExtractionError::ImageDecode(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ExtractionError> {
    validate_image_bytes(bytes)?;
    image::load_from_memory(bytes).map_err(|e| ExtractionError::ImageDecode(e.to_string()))
}

/// Encode as PNG for engines that take encoded bytes.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, ExtractionError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageDecode(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// Tesseract's per-token "no confidence" marker.
pub const UNRELIABLE_CONFIDENCE: f32 = -1.0;

/// Result of the cheap "is there text worth OCR-ing?" decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextGateResult {
    pub has_text: bool,
    /// Mean token confidence, 0-100.
    pub confidence: f32,
}

impl TextGateResult {
    pub fn no_text() -> Self {
        Self {
            has_text: false,
            confidence: 0.0,
        }
    }
}

/// Position and confidence of one accepted word (pixel coordinates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub word: String,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
}

/// Text extracted from one image.
///
/// `confidence` is the mean over every counted token, including words below
/// the acceptance threshold and unreliable detections (as 0); it measures
/// extraction quality, while `bounding_boxes` holds only accepted words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f32,
    pub bounding_boxes: Vec<BoundingBox>,
    pub language: String,
    pub word_count: usize,
}

impl OcrResult {
    /// Degraded result used when a batch item fails.
    pub fn empty(language: &str) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            bounding_boxes: Vec::new(),
            language: language.to_string(),
            word_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bounding_boxes.is_empty()
    }
}

/// Confidence as reported by an engine: numeric or string-encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RawConfidence {
    Number(f64),
    Text(String),
}

impl RawConfidence {
    /// Parsed value, or `None` when the engine gave something unparsable.
    pub fn value(&self) -> Option<f32> {
        let v = match self {
            Self::Number(n) => *n as f32,
            Self::Text(s) => s.trim().parse::<f32>().ok()?,
        };
        v.is_finite().then_some(v)
    }
}

impl From<f64> for RawConfidence {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RawConfidence {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// One token exactly as the OCR engine produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToken {
    pub text: String,
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: RawConfidence,
}

/// An image pulled out of a compound document.
#[derive(Clone)]
pub struct ExtractedImage {
    pub image: DynamicImage,
    /// 1-based page (PDF) or slide (presentation) number when known.
    pub page_number: Option<u32>,
    pub width: u32,
    pub height: u32,
    /// Source encoding, e.g. "jpeg", "png", "raw-rgb".
    pub format: String,
    /// Where in the container it came from (XObject name or package part).
    pub source: String,
}

impl std::fmt::Debug for ExtractedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractedImage")
            .field("page_number", &self.page_number)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("source", &self.source)
            .finish()
    }
}

/// OCR engine abstraction (allows mocking for tests).
pub trait OcrEngine: Send + Sync {
    /// Recognize tokens in reading order of the engine, using a single
    /// uniform text block layout.
    fn recognize(
        &self,
        image: &DynamicImage,
        language: &str,
    ) -> Result<Vec<RawToken>, ExtractionError>;
}

/// Binary edge map producer over a luma image.
pub trait EdgeDetector: Send + Sync {
    /// Returns a map of identical dimensions: 255 = edge, 0 = background.
    fn detect_edges(&self, luma: &GrayImage) -> GrayImage;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_confidence_parses_numbers_and_strings() {
        assert_eq!(RawConfidence::Number(91.5).value(), Some(91.5));
        assert_eq!(RawConfidence::from(" 87 ").value(), Some(87.0));
        assert_eq!(RawConfidence::from("-1").value(), Some(-1.0));
        assert_eq!(RawConfidence::from("n/a").value(), None);
        assert_eq!(RawConfidence::Number(f64::NAN).value(), None);
    }

    #[test]
    fn empty_ocr_result_is_consistent() {
        let result = OcrResult::empty("eng");
        assert_eq!(result.word_count, result.bounding_boxes.len());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.language, "eng");
        assert!(result.is_empty());
    }

    #[test]
    fn gate_no_text_is_zero() {
        let r = TextGateResult::no_text();
        assert!(!r.has_text);
        assert_eq!(r.confidence, 0.0);
    }
}

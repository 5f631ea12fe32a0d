use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::edges::{edge_density, to_luma, SobelEdgeDetector};
use super::ocr::{counted_tokens, decode_image, mean_confidence};
use super::types::{EdgeDetector, OcrEngine, TextGateResult};
use super::ExtractionError;
use crate::pipeline::resilience::CallGuard;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextGateConfig {
    /// Fraction of edge pixels below which OCR is skipped.
    pub edge_density_threshold: f32,
    /// A word is confident when its confidence is strictly above this.
    pub word_confidence_threshold: f32,
    pub min_confident_words: usize,
    pub language: String,
}

impl Default for TextGateConfig {
    fn default() -> Self {
        Self {
            edge_density_threshold: 0.15,
            word_confidence_threshold: 60.0,
            min_confident_words: 5,
            language: "eng".to_string(),
        }
    }
}

/// Two-stage text detector: edge density first, a single OCR pass second.
pub struct TextPresenceGate {
    engine: Arc<dyn OcrEngine>,
    detector: Box<dyn EdgeDetector>,
    config: TextGateConfig,
    guard: CallGuard,
}

impl TextPresenceGate {
    pub fn new(engine: Arc<dyn OcrEngine>, config: TextGateConfig) -> Self {
        Self {
            engine,
            detector: Box::new(SobelEdgeDetector::default()),
            config,
            guard: CallGuard::unguarded("text_gate.ocr"),
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn EdgeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_guard(mut self, guard: CallGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &TextGateConfig {
        &self.config
    }

    pub fn detect(&self, image: &DynamicImage) -> Result<TextGateResult, ExtractionError> {
        let edges = self.detector.detect_edges(&to_luma(image));
        let density = edge_density(&edges);
        if density < self.config.edge_density_threshold {
            tracing::debug!(
                density,
                threshold = self.config.edge_density_threshold,
                "Edge density below threshold, skipping OCR"
            );
            return Ok(TextGateResult::no_text());
        }

        let tokens = self
            .guard
            .call(|| self.engine.recognize(image, &self.config.language))?;
        let counted = counted_tokens(&tokens);

        let confident = counted
            .iter()
            .filter(|t| t.reliable && t.confidence > self.config.word_confidence_threshold)
            .count();
        let has_text = confident >= self.config.min_confident_words;
        let confidence = mean_confidence(&counted);

        tracing::debug!(density, confident, has_text, confidence, "Text gate decision");

        Ok(TextGateResult {
            has_text,
            confidence,
        })
    }

    pub fn detect_bytes(&self, bytes: &[u8]) -> Result<TextGateResult, ExtractionError> {
        let image = decode_image(bytes)?;
        self.detect(&image)
    }

    /// Order-preserving. A failed item is reported as no text.
    pub fn detect_batch(&self, images: &[DynamicImage]) -> Vec<TextGateResult> {
        images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                self.detect(image).unwrap_or_else(|e| {
                    tracing::warn!(index, error = %e, "Text gate failed for batch item");
                    TextGateResult::no_text()
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::ocr::{encode_png, MockOcrEngine};
    use crate::pipeline::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy};
    use image::{GrayImage, Luma};
    use std::time::Duration;

    fn flat() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(200, 200, Luma([200])))
    }

    fn busy() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(120, 120, |x, _| {
            if (x / 2) % 2 == 0 {
                Luma([0])
            } else {
                Luma([255])
            }
        }))
    }

    fn gate(engine: Arc<MockOcrEngine>) -> TextPresenceGate {
        TextPresenceGate::new(engine, TextGateConfig::default())
    }

    #[test]
    fn low_edge_density_never_calls_ocr() {
        let engine = Arc::new(MockOcrEngine::with_words("a b c d e f", 99.0));
        let result = gate(engine.clone()).detect(&flat()).unwrap();
        assert_eq!(result, TextGateResult::no_text());
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn enough_confident_words_means_text() {
        let engine = Arc::new(MockOcrEngine::with_words("the quick brown fox jumps", 90.0));
        let result = gate(engine.clone()).detect(&busy()).unwrap();
        assert!(result.has_text);
        assert!((result.confidence - 90.0).abs() < 1e-4);
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn too_few_confident_words_reports_confidence_anyway() {
        let engine = Arc::new(MockOcrEngine::with_words("only four words here", 80.0));
        let result = gate(engine).detect(&busy()).unwrap();
        assert!(!result.has_text);
        assert!((result.confidence - 80.0).abs() < 1e-4);
    }

    #[test]
    fn word_threshold_is_strict() {
        // Exactly at the threshold is not confident.
        let engine = Arc::new(MockOcrEngine::with_words("one two three four five", 60.0));
        let result = gate(engine).detect(&busy()).unwrap();
        assert!(!result.has_text);
    }

    #[test]
    fn engine_failure_propagates_from_detect() {
        let engine = Arc::new(MockOcrEngine::failing("boom"));
        let err = gate(engine).detect(&busy()).unwrap_err();
        assert!(matches!(err, ExtractionError::OcrProcessing(_)));
    }

    #[test]
    fn batch_isolates_failures_and_keeps_order() {
        let engine = Arc::new(MockOcrEngine::failing("boom"));
        let results = gate(engine.clone()).detect_batch(&[flat(), busy(), flat()]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| *r == TextGateResult::no_text()));
        // Only the busy image reached the engine.
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn detect_bytes_decodes_png() {
        let engine = Arc::new(MockOcrEngine::with_words("a b c d e", 95.0));
        let png = encode_png(&busy()).unwrap();
        assert!(gate(engine).detect_bytes(&png).unwrap().has_text);
    }

    #[test]
    fn open_breaker_short_circuits_ocr() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(600),
        });
        let engine = Arc::new(MockOcrEngine::failing("down"));
        let gate = gate(engine.clone()).with_guard(CallGuard::for_dependency(
            "text_gate.ocr",
            RetryPolicy::no_retry(),
            &registry,
            "ocr",
        ));

        assert!(matches!(gate.detect(&busy()), Err(ExtractionError::OcrProcessing(_))));
        assert!(matches!(gate.detect(&busy()), Err(ExtractionError::CircuitOpen(_))));
        assert_eq!(engine.calls(), 1);
    }
}

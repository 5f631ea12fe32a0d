pub mod types;
pub mod edges;
pub mod ocr;
pub mod text_gate;
pub mod embedded;
pub mod document_text;

pub use types::*;
pub use edges::*;
pub use ocr::*;
pub use text_gate::*;
pub use embedded::*;
pub use document_text::*;

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::resilience::{CircuitOpenError, Classify, ErrorKind};

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tesseract OCR initialization failed: {0}")]
    OcrInit(String),

    #[error("Tesseract OCR configuration error: {0}")]
    OcrConfig(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("OCR engine timed out: {0}")]
    OcrTimeout(String),

    #[error("Tessdata not found at: {0}")]
    TessdataNotFound(PathBuf),

    #[error("Image decoding failed: {0}")]
    ImageDecode(String),

    #[error("Document parsing failed: {0}")]
    DocumentParse(String),

    #[error("Unsupported container format: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl Classify for ExtractionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Storage,
            Self::OcrInit(_) | Self::OcrConfig(_) | Self::TessdataNotFound(_) => ErrorKind::Engine,
            Self::OcrProcessing(_) => ErrorKind::Engine,
            Self::OcrTimeout(_) => ErrorKind::Timeout,
            Self::ImageDecode(_) | Self::DocumentParse(_) => ErrorKind::Decode,
            Self::UnsupportedFormat(_) => ErrorKind::InvalidInput,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
        }
    }
}

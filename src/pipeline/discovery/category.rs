use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Broad file categories the pipeline routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Image,
    Video,
    Document,
    Json,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp", "heic", "heif",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v", "wmv", "mpeg", "mpg"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "pptx", "xlsx", "odt", "txt", "md", "markdown", "rtf", "html", "htm",
];
const JSON_EXTENSIONS: &[&str] = &["json"];

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Json => "json",
        }
    }

    /// Category for a bare extension (case-insensitive, no leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        let ext = ext.as_str();
        if IMAGE_EXTENSIONS.contains(&ext) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            Some(Self::Video)
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Some(Self::Document)
        } else if JSON_EXTENSIONS.contains(&ext) {
            Some(Self::Json)
        } else {
            None
        }
    }

    /// Category derived solely from the path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// A discovered file, ready for routing. Immutable once produced by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub category: FileCategory,
    pub size_bytes: u64,
}

impl FileDescriptor {
    /// Best-effort MIME type from the extension.
    pub fn mime_type(&self) -> String {
        mime_guess::from_path(&self.absolute_path)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    /// Relative path with `/` separators, as matched against ignore rules.
    pub fn relative_str(&self) -> String {
        normalize_relative(&self.relative_path)
    }
}

/// Render a root-relative path with `/` separators on every platform.
pub fn normalize_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

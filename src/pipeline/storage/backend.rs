use std::path::{Path, PathBuf};

use super::types::{ArtifactKind, ArtifactStore};
use super::StorageError;

const URI_SCHEME: &str = "fs://";

/// Local-directory artifact store: `fs://<kind>/<owner>/<file>` maps to
/// `<root>/<kind>/<owner>/<file>`.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, StorageError> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;
        let parts: Vec<&str> = rest.split('/').collect();
        let [kind, owner, file] = parts.as_slice() else {
            return Err(StorageError::InvalidUri(uri.to_string()));
        };
        if ArtifactKind::from_name(kind).is_none()
            || sanitize_component(owner) != *owner
            || sanitize_component(file) != *file
        {
            return Err(StorageError::InvalidUri(uri.to_string()));
        }
        Ok(self.root.join(kind).join(owner).join(file))
    }
}

/// Strip separators, NUL and parent-directory sequences from one path component.
pub fn sanitize_component(name: &str) -> String {
    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .map(|c| if c.is_control() { '_' } else { c })
        .take(255)
        .collect();
    let clean = clean.replace("..", "");

    if clean.is_empty() {
        "artifact".to_string()
    } else {
        clean
    }
}

impl ArtifactStore for FilesystemStore {
    fn store(
        &self,
        kind: ArtifactKind,
        owning_id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<String, StorageError> {
        let owner = sanitize_component(owning_id);
        let file = sanitize_component(filename);
        let dir = self.root.join(kind.as_str()).join(&owner);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(&file), bytes)?;

        let uri = format!("{URI_SCHEME}{}/{owner}/{file}", kind.as_str());
        tracing::debug!(uri = %uri, bytes = bytes.len(), "Artifact stored");
        Ok(uri)
    }

    fn retrieve(&self, uri: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(uri)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(uri.to_string()),
            _ => StorageError::Io(e),
        })
    }

    fn exists(&self, uri: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(uri)?.is_file())
    }

    fn delete(&self, uri: &str) -> Result<bool, StorageError> {
        let path = self.resolve(uri)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn size(&self, uri: &str) -> Result<u64, StorageError> {
        let path = self.resolve(uri)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(uri.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FilesystemStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(&dir.path().join("artifacts")).unwrap();
        (dir, store)
    }

    #[test]
    fn store_retrieve_delete_cycle() {
        let (_dir, store) = store();
        let uri = store
            .store(ArtifactKind::OcrText, "scan-001", b"Invoice 2024", "page1.txt")
            .unwrap();
        assert_eq!(uri, "fs://ocr_text/scan-001/page1.txt");
        assert!(store.exists(&uri).unwrap());
        assert_eq!(store.size(&uri).unwrap(), 12);
        assert_eq!(store.retrieve(&uri).unwrap(), b"Invoice 2024");

        assert!(store.delete(&uri).unwrap());
        assert!(!store.delete(&uri).unwrap());
        assert!(!store.exists(&uri).unwrap());
        assert!(matches!(store.retrieve(&uri), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn filenames_are_sanitized() {
        let (_dir, store) = store();
        let uri = store
            .store(ArtifactKind::ExtractedImage, "../../etc", b"x", "../passwd")
            .unwrap();
        assert_eq!(uri, "fs://extracted_image/etc/passwd");
        assert!(store.root().join("extracted_image/etc/passwd").is_file());
    }

    #[test]
    fn malformed_uris_are_rejected() {
        let (_dir, store) = store();
        for uri in [
            "s3://bucket/key",
            "fs://ocr_text/only-two",
            "fs://bogus_kind/a/b",
            "fs://ocr_text/a/../b",
            "fs://ocr_text/../../x",
        ] {
            assert!(
                matches!(store.exists(uri), Err(StorageError::InvalidUri(_))),
                "accepted {uri}"
            );
        }
    }

    #[test]
    fn sanitize_handles_edge_cases() {
        assert_eq!(sanitize_component("report.pdf"), "report.pdf");
        assert_eq!(sanitize_component(""), "artifact");
        assert_eq!(sanitize_component(".."), "artifact");
        assert_eq!(sanitize_component("a\0b/c"), "abc");
        assert_eq!(sanitize_component(&"x".repeat(300)).len(), 255);
    }
}

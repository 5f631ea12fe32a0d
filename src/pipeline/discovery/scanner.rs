use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use super::category::{normalize_relative, FileCategory, FileDescriptor};
use super::ignore::{IgnoreRuleSet, DEFAULT_IGNORE_FILE};
use super::DiscoveryError;

/// Scan behaviour. Loaded from the `scan` section of the pipeline config.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub ignore_file_name: String,
    pub follow_links: bool,
    /// Maximum directory depth below the root; `None` walks everything.
    pub max_depth: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_file_name: DEFAULT_IGNORE_FILE.to_string(),
            follow_links: false,
            max_depth: None,
        }
    }
}

/// Counters accumulated while a [`Scan`] is consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounters {
    /// Entries matching an ignore rule (a pruned directory counts once).
    pub ignored: usize,
    /// Files whose extension maps to no category.
    pub unsupported: usize,
    /// Entries that could not be read or stat'ed.
    pub unreadable: usize,
    /// Supported names that are not regular files (unfollowed symlinks,
    /// sockets, fifos).
    pub skipped_other: usize,
}

/// Aggregate view of a completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub total_files: usize,
    pub total_bytes: u64,
    pub by_category: BTreeMap<FileCategory, usize>,
    pub ignored: usize,
    pub unsupported: usize,
    pub unreadable: usize,
    pub skipped_other: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub root: PathBuf,
    pub files: Vec<FileDescriptor>,
    pub summary: ScanSummary,
}

/// Recursive, ignore-aware file discovery.
#[derive(Debug, Clone, Default)]
pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Start a lazy walk of `root`. Every call re-reads the ignore file and
    /// walks from scratch.
    pub fn scan(&self, root: &Path) -> Result<Scan, DiscoveryError> {
        if !root.exists() {
            return Err(DiscoveryError::NotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(DiscoveryError::NotADirectory(root.to_path_buf()));
        }

        let rules = IgnoreRuleSet::load(root, &self.config.ignore_file_name);
        let mut walker = WalkDir::new(root).follow_links(self.config.follow_links);
        if let Some(depth) = self.config.max_depth {
            walker = walker.max_depth(depth);
        }

        tracing::debug!(
            root = %root.display(),
            ignore_patterns = rules.len(),
            "Starting scan"
        );

        Ok(Scan {
            root: root.to_path_buf(),
            rules,
            inner: walker.into_iter(),
            counters: ScanCounters::default(),
        })
    }

    /// Run a scan to completion and collect descriptors plus summary counters.
    pub fn scan_all(&self, root: &Path) -> Result<ScanReport, DiscoveryError> {
        let mut scan = self.scan(root)?;
        let mut files = Vec::new();
        let mut summary = ScanSummary::default();

        for descriptor in scan.by_ref() {
            summary.total_files += 1;
            summary.total_bytes += descriptor.size_bytes;
            *summary.by_category.entry(descriptor.category).or_insert(0) += 1;
            files.push(descriptor);
        }

        let counters = scan.counters();
        summary.ignored = counters.ignored;
        summary.unsupported = counters.unsupported;
        summary.unreadable = counters.unreadable;
        summary.skipped_other = counters.skipped_other;

        tracing::info!(
            root = %root.display(),
            files = summary.total_files,
            bytes = summary.total_bytes,
            ignored = summary.ignored,
            unsupported = summary.unsupported,
            unreadable = summary.unreadable,
            skipped_other = summary.skipped_other,
            "Scan complete"
        );

        Ok(ScanReport {
            root: root.to_path_buf(),
            files,
            summary,
        })
    }
}

/// Lazy sequence of descriptors in filesystem traversal order.
pub struct Scan {
    root: PathBuf,
    rules: IgnoreRuleSet,
    inner: walkdir::IntoIter,
    counters: ScanCounters,
}

impl Scan {
    pub fn counters(&self) -> &ScanCounters {
        &self.counters
    }

    pub fn rules(&self) -> &IgnoreRuleSet {
        &self.rules
    }
}

impl Iterator for Scan {
    type Item = FileDescriptor;

    fn next(&mut self) -> Option<FileDescriptor> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(
                        path = ?e.path(),
                        error = %e,
                        "Unreadable entry, skipping"
                    );
                    self.counters.unreadable += 1;
                    continue;
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let relative_str = normalize_relative(&relative);
            let file_type = entry.file_type();

            if self.rules.is_ignored(&relative_str) {
                if file_type.is_dir() {
                    // Prune: descendants are never visited.
                    self.inner.skip_current_dir();
                }
                self.counters.ignored += 1;
                continue;
            }

            if file_type.is_dir() {
                continue;
            }

            let Some(category) = FileCategory::from_path(entry.path()) else {
                self.counters.unsupported += 1;
                continue;
            };

            let size_bytes = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => {
                    tracing::debug!(
                        path = %entry.path().display(),
                        "Not a regular file, skipping"
                    );
                    self.counters.skipped_other += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "Could not stat file, skipping"
                    );
                    self.counters.unreadable += 1;
                    continue;
                }
            };

            return Some(FileDescriptor {
                absolute_path: entry.path().to_path_buf(),
                relative_path: relative,
                category,
                size_bytes,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn relative_paths(report: &ScanReport) -> Vec<String> {
        let mut paths: Vec<String> = report.files.iter().map(|f| f.relative_str()).collect();
        paths.sort();
        paths
    }

    #[test]
    fn tmp_pattern_leaves_only_photo() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".enrichignore", b"*.tmp\n");
        write(dir.path(), "cache/tmp.tmp", b"x");
        write(dir.path(), "photos/summer.jpg", b"jpeg");

        let report = FileScanner::default().scan_all(dir.path()).unwrap();
        assert_eq!(relative_paths(&report), vec!["photos/summer.jpg"]);
        assert_eq!(report.files[0].category, FileCategory::Image);
        assert_eq!(report.files[0].size_bytes, 4);
    }

    #[test]
    fn ignored_directory_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".enrichignore", b"node_modules\n");
        write(dir.path(), "node_modules/pkg/logo.png", b"png");
        write(dir.path(), "node_modules/pkg/deep/data.json", b"{}");
        write(dir.path(), "src/readme.md", b"# hi");

        let report = FileScanner::default().scan_all(dir.path()).unwrap();
        assert_eq!(relative_paths(&report), vec!["src/readme.md"]);
        // The pruned directory counts once; its children are never visited.
        assert_eq!(report.summary.ignored, 1);
        for file in &report.files {
            assert!(!file.relative_str().starts_with("node_modules"));
        }
    }

    #[test]
    fn unknown_extensions_are_skipped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.exe", b"MZ");
        write(dir.path(), "b.json", b"{}");
        write(dir.path(), "c", b"no extension");

        let report = FileScanner::default().scan_all(dir.path()).unwrap();
        assert_eq!(relative_paths(&report), vec!["b.json"]);
        assert_eq!(report.summary.unsupported, 2);
    }

    #[cfg(unix)]
    #[test]
    fn unfollowed_symlinks_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "real.png", b"png");
        std::os::unix::fs::symlink(dir.path().join("real.png"), dir.path().join("link.png"))
            .unwrap();

        let report = FileScanner::default().scan_all(dir.path()).unwrap();
        assert_eq!(relative_paths(&report), vec!["real.png"]);
        assert_eq!(report.summary.skipped_other, 1);
        assert_eq!(report.summary.unreadable, 0);
    }

    #[test]
    fn summary_counts_by_category_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "img/a.png", b"12345");
        write(dir.path(), "img/b.jpg", b"123");
        write(dir.path(), "docs/c.pdf", b"12");
        write(dir.path(), "clips/d.mp4", b"1");
        write(dir.path(), "records/e.json", b"{}");

        let report = FileScanner::default().scan_all(dir.path()).unwrap();
        let summary = &report.summary;
        assert_eq!(summary.total_files, 5);
        assert_eq!(summary.total_bytes, 13);
        assert_eq!(summary.by_category[&FileCategory::Image], 2);
        assert_eq!(summary.by_category[&FileCategory::Document], 1);
        assert_eq!(summary.by_category[&FileCategory::Video], 1);
        assert_eq!(summary.by_category[&FileCategory::Json], 1);
    }

    #[test]
    fn missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileScanner::default().scan(&dir.path().join("nope"));
        assert!(matches!(result, Err(DiscoveryError::NotFound(_))));
    }

    #[test]
    fn file_root_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "file.txt", b"x");
        let result = FileScanner::default().scan(&dir.path().join("file.txt"));
        assert!(matches!(result, Err(DiscoveryError::NotADirectory(_))));
    }

    #[test]
    fn scan_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.png", b"1");
        let scanner = FileScanner::default();
        assert_eq!(scanner.scan(dir.path()).unwrap().count(), 1);
        write(dir.path(), "b.png", b"2");
        assert_eq!(scanner.scan(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn custom_ignore_file_name_and_depth() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".skip", b"*.png\n");
        write(dir.path(), "top.png", b"1");
        write(dir.path(), "top.jpg", b"1");
        write(dir.path(), "nested/deeper/x.jpg", b"1");

        let scanner = FileScanner::new(ScanConfig {
            ignore_file_name: ".skip".into(),
            follow_links: false,
            max_depth: Some(1),
        });
        let report = scanner.scan_all(dir.path()).unwrap();
        assert_eq!(relative_paths(&report), vec!["top.jpg"]);
    }
}

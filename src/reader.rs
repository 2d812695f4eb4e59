//! Source document readers.
//!
//! An [`Extractor`] turns a source location into raw [`Document`]s carrying
//! source metadata. [`FilesystemReader`] walks a directory (or reads a
//! single file), applies include/exclude globs, and extracts each file's
//! text with [`crate::extract`].
//!
//! Every produced document carries:
//!
//! | Key | Value |
//! |-----|-------|
//! | `source` | Path relative to the scanned root |
//! | `file_name` | Final path component |
//! | `content_type` | MIME type inferred from the extension |
//! | `modified_at` | RFC 3339 modification time |

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::error::{GatewayError, Result};
use crate::extract::{content_type_for, extract_text};
use crate::models::Document;

pub trait Extractor: Send + Sync {
    /// Read every document found at `location`.
    fn read(&self, location: &Path) -> Result<Vec<Document>>;
}

/// Directories skipped no matter what the configuration says.
const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

pub struct FilesystemReader {
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FilesystemReader {
    pub fn new(include_globs: &[String], exclude_globs: &[String], follow_symlinks: bool) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks,
        })
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        Self::new(&config.include_globs, &config.exclude_globs, config.follow_symlinks)
    }

    /// Files under `root` that pass the globs, sorted by relative path.
    pub fn scan(&self, root: &Path) -> Result<Vec<PathBuf>> {
        if !root.exists() {
            return Err(extraction_error(root, "source location does not exist"));
        }
        if root.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(self.follow_symlinks) {
            let entry = entry.map_err(|e| extraction_error(root, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative(entry.path(), root);
            if self.exclude.is_match(&rel) || !self.include.is_match(&rel) {
                continue;
            }
            files.push(entry.into_path());
        }

        files.sort();
        Ok(files)
    }

    fn read_file(&self, path: &Path, root: &Path) -> Result<Document> {
        let bytes = std::fs::read(path).map_err(|e| extraction_error(path, e))?;
        let content_type = content_type_for(path);
        let text = extract_text(&bytes, content_type).map_err(|e| extraction_error(path, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let source = if root.is_file() {
            file_name.clone()
        } else {
            relative(path, root)
        };

        let mut doc = Document::new(text)
            .with_metadata("source", source)
            .with_metadata("file_name", file_name)
            .with_metadata("content_type", content_type);
        if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
            let modified: DateTime<Utc> = modified.into();
            doc = doc.with_metadata("modified_at", modified.to_rfc3339());
        }
        Ok(doc)
    }
}

impl Extractor for FilesystemReader {
    fn read(&self, location: &Path) -> Result<Vec<Document>> {
        let files = self.scan(location)?;
        let mut docs = Vec::with_capacity(files.len());
        for path in files {
            docs.push(self.read_file(&path, location)?);
        }
        tracing::debug!(location = %location.display(), documents = docs.len(), "read source");
        Ok(docs)
    }
}

fn relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn extraction_error(location: &Path, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Extraction {
        location: location.display().to_string(),
        message: err.to_string(),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| GatewayError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| GatewayError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetaValue;

    fn reader(include: &[&str]) -> FilesystemReader {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        FilesystemReader::new(&include, &[], false).unwrap()
    }

    #[test]
    fn test_reads_matching_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("guides")).unwrap();
        std::fs::write(dir.path().join("b.md"), "beta").unwrap();
        std::fs::write(dir.path().join("guides/a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("skip.bin"), "binary").unwrap();

        let docs = reader(&["**/*.md", "**/*.txt"]).read(dir.path()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "beta");
        assert_eq!(docs[0].metadata["source"], MetaValue::from("b.md"));
        assert_eq!(docs[1].metadata["source"], MetaValue::from("guides/a.txt"));
        assert_eq!(docs[1].metadata["file_name"], MetaValue::from("a.txt"));
        assert_eq!(docs[1].metadata["content_type"], MetaValue::from("text/plain"));
        assert!(docs[1].metadata.contains_key("modified_at"));
    }

    #[test]
    fn test_default_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/readme.md"), "dep").unwrap();
        std::fs::write(dir.path().join("keep.md"), "keep").unwrap();

        let files = reader(&["**/*.md"]).scan(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("keep.md"));
    }

    #[test]
    fn test_single_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("only.txt");
        std::fs::write(&path, "solo").unwrap();

        let docs = reader(&["**/*.md"]).read(&path).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata["source"], MetaValue::from("only.txt"));
    }

    #[test]
    fn test_missing_location_is_extraction_error() {
        let err = reader(&["**/*"]).read(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.code(), "extraction_error");
    }

    #[test]
    fn test_unreadable_pdf_aborts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.pdf"), "not really a pdf").unwrap();
        let err = reader(&["**/*.pdf"]).read(dir.path()).unwrap_err();
        assert!(matches!(err, GatewayError::Extraction { ref location, .. } if location.ends_with("broken.pdf")));
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let err = FilesystemReader::new(&["[".to_string()], &[], false).err().unwrap();
        assert_eq!(err.code(), "config_error");
    }
}

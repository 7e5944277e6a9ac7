use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rag_harness_core::code_chunk::Language;
use rag_harness_core::embedding::sha256_hex;
use rag_harness_core::models::Modality;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::queue::Lane;
use crate::config::IndexingConfig;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Document,
    Code,
    Image,
}

impl FileType {
    pub fn from_path(path: &Path) -> FileType {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            FileType::Image
        } else if Language::from_path(path).is_some() {
            FileType::Code
        } else {
            FileType::Document
        }
    }

    pub fn modality(&self) -> Modality {
        match self {
            FileType::Document => Modality::Docs,
            FileType::Code => Modality::Code,
            FileType::Image => Modality::Images,
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            FileType::Document => Lane::Document,
            FileType::Code => Lane::Code,
            FileType::Image => Lane::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the root, `/`-separated.
    pub path: String,
    pub abs_path: PathBuf,
    pub content_hash: String,
    pub mtime: i64,
    pub size: u64,
    pub file_type: FileType,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub root: String,
    /// Sorted by path.
    pub files: Vec<ScannedFile>,
    pub aggregate_hash: String,
    pub total_size: u64,
}

/// Hash already known for a path, reused when mtime and size are unchanged.
#[derive(Debug, Clone)]
pub struct HashHint {
    pub mtime: i64,
    pub size: u64,
    pub content_hash: String,
}

/// Walk `root`, filter by globs and size, and fingerprint every file.
///
/// Text files that are not valid UTF-8 are skipped. Blocking: call from
/// `spawn_blocking`.
pub fn scan_root(root: &Path, config: &IndexingConfig, hints: &HashMap<String, HashHint>) -> Result<ScanResult> {
    if !root.is_dir() {
        bail!("Indexing root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "skipping file without metadata");
                continue;
            }
        };
        let size = metadata.len();
        if size > config.max_file_bytes {
            tracing::debug!(path = %rel_str, size, "skipping oversized file");
            continue;
        }
        let mtime = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let file_type = FileType::from_path(path);
        let content_hash = match hints.get(&rel_str) {
            Some(h) if h.mtime == mtime && h.size == size => h.content_hash.clone(),
            _ => {
                let bytes = match std::fs::read(path) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(path = %rel_str, error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                if file_type != FileType::Image && std::str::from_utf8(&bytes).is_err() {
                    tracing::debug!(path = %rel_str, "skipping non-UTF-8 file");
                    continue;
                }
                sha256_hex(&bytes)
            }
        };

        files.push(ScannedFile {
            path: rel_str,
            abs_path: path.to_path_buf(),
            content_hash,
            mtime,
            size,
            file_type,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    let root_str = root.to_string_lossy().to_string();
    let aggregate_hash = aggregate_hash(&root_str, &files);
    let total_size = files.iter().map(|f| f.size).sum();

    Ok(ScanResult {
        root: root_str,
        files,
        aggregate_hash,
        total_size,
    })
}

/// SHA-256 over the root and each file's `(path, mtime, content_hash, size)`
/// in path order.
pub fn aggregate_hash(root: &str, files: &[ScannedFile]) -> String {
    let mut sorted: Vec<&ScannedFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    hasher.update(root.as_bytes());
    hasher.update([0u8]);
    for f in sorted {
        hasher.update(f.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(f.mtime.to_le_bytes());
        hasher.update(f.content_hash.as_bytes());
        hasher.update(f.size.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

//! Filesystem watcher for continuous indexing.
//!
//! Debounces create/modify/remove events under an indexing root and hands
//! the changed paths to [`Orchestrator::watch`](super::Orchestrator::watch),
//! which turns each batch into an incremental run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;

/// Watches one root. Events stop when this is dropped.
pub struct RootWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl RootWatcher {
    /// Start watching `root` recursively. Paths starting with any entry of
    /// `ignore` (the database and its WAL files, say) never produce events.
    pub fn start(
        root: &Path,
        debounce: Duration,
        ignore: Vec<PathBuf>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<PathBuf>>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| match result {
            Ok(events) => {
                let mut changed: Vec<PathBuf> = Vec::new();
                for event in events {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        continue;
                    }
                    for path in &event.paths {
                        if is_ignored(path, &ignore) || changed.contains(path) {
                            continue;
                        }
                        tracing::debug!(path = %path.display(), kind = ?event.kind, "watch event");
                        changed.push(path.clone());
                    }
                }
                if !changed.is_empty() {
                    let _ = tx.send(changed);
                }
            }
            Err(errors) => {
                for e in errors {
                    tracing::warn!(error = %e, "watcher error");
                }
            }
        })?;

        debouncer.watch(root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), debounce_ms = debounce.as_millis() as u64, "watching for changes");

        Ok((
            Self {
                _debouncer: debouncer,
            },
            rx,
        ))
    }
}

fn is_ignored(path: &Path, ignore: &[PathBuf]) -> bool {
    let path = path.to_string_lossy();
    ignore
        .iter()
        .any(|prefix| path.starts_with(prefix.to_string_lossy().as_ref()))
}

/// Absolute form of `path` for prefix matching against event paths. The
/// file itself may not exist yet, so only its parent is canonicalized.
pub fn absolute(path: &Path) -> PathBuf {
    if let Ok(p) = std::fs::canonicalize(path) {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            std::fs::canonicalize(parent)
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_prefixes_cover_wal_files() {
        let ignore = vec![PathBuf::from("/data/rag.sqlite")];
        assert!(is_ignored(Path::new("/data/rag.sqlite"), &ignore));
        assert!(is_ignored(Path::new("/data/rag.sqlite-wal"), &ignore));
        assert!(!is_ignored(Path::new("/data/notes.md"), &ignore));
    }

    #[tokio::test]
    async fn test_write_under_root_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let db = root.join("rag.sqlite");
        let (_watcher, mut rx) = RootWatcher::start(&root, Duration::from_millis(50), vec![db.clone()]).unwrap();

        std::fs::write(&db, "ignored").unwrap();
        std::fs::write(root.join("note.md"), "hello").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no watch event within the timeout")
            .unwrap();
        assert!(changed.iter().any(|p| p.ends_with("note.md")));
        assert!(changed.iter().all(|p| !p.starts_with(&db)));
    }
}

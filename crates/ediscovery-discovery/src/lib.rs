//! Enumeration of documents under an allowed root.
//!
//! [`discover`] resolves and orders every candidate path up front (§4.3
//! requires within-run duplicate suppression to keep the first occurrence
//! "by resolved path lexicographic order," which a single depth-first walk
//! can't guarantee — `a.txt` sorts before `a/b.txt` lexicographically but a
//! depth-first walker visits `a/`'s contents first). The returned
//! [`DiscoveryStream`] is still a pull-based iterator over that ordered
//! list: per-document stat/hash/extraction work happens one item at a time
//! as the consumer drives it, so memory beyond the resolved-path list and
//! the already-seen content-hash set stays constant regardless of corpus
//! size.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use ediscovery_ledger::{AuditSink, Details};
use ediscovery_path_guard::PathGuard;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

const HASH_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub sha256: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mtime: DateTime<Utc>,
    pub custodian: Option<String>,
    pub doctype: String,
}

#[derive(Debug, Error)]
pub enum DiscoveryWarning {
    #[error("failed to read {path}: {reason}")]
    ReadError { path: String, reason: String },
    #[error("path traversal attempt rejected: {path}")]
    Traversal { path: String },
}

/// Build a sequence of [`DocumentMetadata`] for all regular files under
/// `root`, ordered by resolved path so that within-run duplicate
/// suppression (§4.3, S2) always keeps the lexicographically-first path for
/// a given content hash. Every candidate passes through `guard` first;
/// symlinks resolving outside the allowed root are skipped (the guard
/// itself records the `PATH_TRAVERSAL_ATTEMPT` audit entry). A second
/// occurrence of a previously seen `sha256` is dropped and recorded as
/// `DUPLICATE_SKIPPED`.
pub fn discover(
    root: impl AsRef<Path>,
    guard: Arc<PathGuard>,
    ledger: Arc<dyn AuditSink>,
    recursive: bool,
) -> DiscoveryStream {
    let root = root.as_ref().to_path_buf();
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut candidates: Vec<Result<PathBuf, DiscoveryWarning>> = Vec::new();
    for entry in WalkDir::new(&root).max_depth(max_depth).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                candidates.push(Err(DiscoveryWarning::ReadError {
                    path: e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    reason: e.to_string(),
                }));
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        // Regular files and symlinks (resolved below) are candidates;
        // anything else (fifo, socket, ...) is not a document.
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }

        match guard.resolve_safe(entry.path()) {
            Ok(p) => candidates.push(Ok(p)),
            Err(_) => candidates.push(Err(DiscoveryWarning::Traversal {
                path: entry.path().display().to_string(),
            })),
        }
    }

    // Resolved, valid candidates sort first, by path; warnings keep walk
    // order and trail them (their relative order carries no meaning).
    candidates.sort_by(|a, b| match (a, b) {
        (Ok(x), Ok(y)) => x.cmp(y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => std::cmp::Ordering::Equal,
    });

    DiscoveryStream {
        root,
        ledger,
        candidates: candidates.into_iter(),
        seen: HashSet::new(),
    }
}

/// Restartable sequence of [`DocumentMetadata`] over a pre-ordered
/// candidate list; see [`discover`]. Per-document stat/hash work is pulled
/// one item at a time as the consumer advances the iterator.
pub struct DiscoveryStream {
    root: PathBuf,
    ledger: Arc<dyn AuditSink>,
    candidates: std::vec::IntoIter<Result<PathBuf, DiscoveryWarning>>,
    seen: HashSet<String>,
}

impl Iterator for DiscoveryStream {
    type Item = Result<DocumentMetadata, DiscoveryWarning>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let resolved = match self.candidates.next()? {
                Ok(p) => p,
                Err(w) => return Some(Err(w)),
            };

            let meta = match std::fs::metadata(&resolved) {
                Ok(m) => m,
                Err(e) => {
                    return Some(Err(DiscoveryWarning::ReadError {
                        path: resolved.display().to_string(),
                        reason: e.to_string(),
                    }))
                }
            };
            if !meta.is_file() {
                // A symlink that resolves to a directory (or other non-file).
                continue;
            }

            let sha256 = match hash_file(&resolved) {
                Ok(h) => h,
                Err(e) => {
                    return Some(Err(DiscoveryWarning::ReadError {
                        path: resolved.display().to_string(),
                        reason: e.to_string(),
                    }))
                }
            };

            // Within-run duplicate suppression: first occurrence by
            // resolved-path order wins, later ones are dropped and audited.
            if !self.seen.insert(sha256.clone()) {
                let mut details = Details::new();
                details.insert("sha256".to_string(), JsonValue::String(sha256));
                details.insert(
                    "path".to_string(),
                    JsonValue::String(resolved.display().to_string()),
                );
                let _ = self.ledger.append("DUPLICATE_SKIPPED", details);
                continue;
            }

            let mtime = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));

            return Some(Ok(DocumentMetadata {
                sha256,
                custodian: derive_custodian(&self.root, &resolved),
                doctype: derive_doctype(&resolved),
                size_bytes: meta.len(),
                mtime,
                path: resolved,
            }));
        }
    }
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn derive_custodian(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?;
    // A file directly under root has no custodian segment above it.
    if components.next().is_none() {
        return None;
    }
    Some(first.as_os_str().to_string_lossy().into_owned())
}

fn derive_doctype(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

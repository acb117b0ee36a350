//! Path resolution and boundary enforcement.
//!
//! No file in the core is permitted to open a path it did not obtain from
//! [`PathGuard::resolve_safe`]. Every rejected candidate — traversal,
//! symlink escape, or plain inaccessibility — is recorded to the audit
//! ledger with `action = PATH_TRAVERSAL_ATTEMPT` before the error is
//! returned to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ediscovery_ledger::{AuditSink, Details};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum PathGuardError {
    #[error("path traversal attempt: '{original}' resolves outside the allowed root")]
    Traversal { original: String, resolved: String },
    #[error("path inaccessible: {0}")]
    Inaccessible(String),
    #[error("invalid allowed root: {0}")]
    InvalidRoot(String),
}

/// Verifies that resolved paths lie inside a fixed allowed root.
pub struct PathGuard {
    allowed_root: PathBuf,
    audit: Arc<dyn AuditSink>,
}

impl PathGuard {
    /// `allowed_root` must exist; it is canonicalized once at construction.
    pub fn new(allowed_root: impl AsRef<Path>, audit: Arc<dyn AuditSink>) -> Result<Self, PathGuardError> {
        let allowed_root = std::fs::canonicalize(allowed_root.as_ref())
            .map_err(|e| PathGuardError::InvalidRoot(format!("{}: {e}", allowed_root.as_ref().display())))?;
        Ok(Self { allowed_root, audit })
    }

    pub fn allowed_root(&self) -> &Path {
        &self.allowed_root
    }

    /// Resolve `candidate` to an absolute, canonical path guaranteed to lie
    /// inside the allowed root, following symlinks. On any failure an audit
    /// entry is appended before the error is returned.
    pub fn resolve_safe(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, PathGuardError> {
        let candidate = candidate.as_ref();

        let resolved = match std::fs::canonicalize(candidate) {
            Ok(p) => p,
            Err(e) => {
                self.emit_traversal_attempt(candidate, None);
                return Err(PathGuardError::Inaccessible(format!("{}: {e}", candidate.display())));
            }
        };

        if resolved.strip_prefix(&self.allowed_root).is_ok() {
            Ok(resolved)
        } else {
            self.emit_traversal_attempt(candidate, Some(&resolved));
            Err(PathGuardError::Traversal {
                original: candidate.display().to_string(),
                resolved: resolved.display().to_string(),
            })
        }
    }

    fn emit_traversal_attempt(&self, original: &Path, resolved: Option<&Path>) {
        let mut details = Details::new();
        details.insert(
            "original".to_string(),
            JsonValue::String(original.display().to_string()),
        );
        details.insert(
            "resolved".to_string(),
            match resolved {
                Some(p) => JsonValue::String(p.display().to_string()),
                None => JsonValue::Null,
            },
        );
        if let Err(e) = self.audit.append("PATH_TRAVERSAL_ATTEMPT", details) {
            error!("failed to record PATH_TRAVERSAL_ATTEMPT: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ediscovery_ledger::AuditLedger;
    use std::fs;
    use tempfile::TempDir;

    fn guard_with_ledger(root: &Path) -> (PathGuard, Arc<AuditLedger>, TempDir) {
        let ledger_dir = TempDir::new().unwrap();
        let ledger = Arc::new(AuditLedger::open(ledger_dir.path().join("audit.jsonl")).unwrap());
        let guard = PathGuard::new(root, ledger.clone()).unwrap();
        (guard, ledger, ledger_dir)
    }

    #[test]
    fn accepts_path_inside_root() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("doc.txt");
        fs::write(&file, b"hello").unwrap();
        let (guard, ledger, _ledger_dir) = guard_with_ledger(tmp.path());

        let resolved = guard.resolve_safe(&file).unwrap();
        assert!(resolved.starts_with(guard.allowed_root()));
        assert_eq!(ledger.entry_count(), 0);
    }

    #[test]
    fn rejects_dotdot_traversal() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("corpus");
        fs::create_dir(&sub).unwrap();
        fs::write(tmp.path().join("secret.txt"), b"nope").unwrap();
        let (guard, ledger, _ledger_dir) = guard_with_ledger(&sub);

        let candidate = sub.join("../secret.txt");
        let err = guard.resolve_safe(&candidate).unwrap_err();
        assert!(matches!(err, PathGuardError::Traversal { .. }));
        assert_eq!(ledger.entry_count(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn rejects_symlink_escape() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("corpus");
        fs::create_dir(&root).unwrap();
        let outside = tmp.path().join("outside.txt");
        fs::write(&outside, b"classified").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let (guard, ledger, _ledger_dir) = guard_with_ledger(&root);
        let err = guard.resolve_safe(root.join("link")).unwrap_err();
        assert!(matches!(err, PathGuardError::Traversal { .. }));
        assert_eq!(ledger.entry_count(), 1);
    }

    #[test]
    fn rejects_inaccessible_path() {
        let tmp = TempDir::new().unwrap();
        let (guard, ledger, _ledger_dir) = guard_with_ledger(tmp.path());
        let err = guard.resolve_safe(tmp.path().join("missing.txt")).unwrap_err();
        assert!(matches!(err, PathGuardError::Inaccessible(_)));
        assert_eq!(ledger.entry_count(), 1);
    }
}

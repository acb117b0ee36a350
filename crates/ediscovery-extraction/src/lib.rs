//! Text Extraction Facade.
//!
//! Maps a [`DocumentMetadata`] to extracted text by dispatching on
//! `doctype`. Format-specific extractors (PDF rendering, office-document
//! parsing, OCR) are external collaborators out of this core's scope; this
//! crate only defines the seam they plug into and ships a [`NullExtractor`]
//! for plain-text formats and tests.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use ediscovery_discovery::DocumentMetadata;
use serde_json::Value as JsonValue;
use tracing::warn;

pub mod worker_protocol;

#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub text: String,
    pub metadata: HashMap<String, JsonValue>,
    pub skip_reason: Option<String>,
}

impl ExtractionResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            metadata: HashMap::new(),
            skip_reason: Some(reason.into()),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }
}

/// A single-format extractor. Implementations must never panic across the
/// facade boundary in production use — the facade catches panics defensively,
/// but real isolation comes from running extraction in a worker process
/// (§5), not from this trait.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> ExtractionResult;
}

/// Reads UTF-8 plain-text formats verbatim; anything else is a skip.
pub struct NullExtractor;

impl TextExtractor for NullExtractor {
    fn extract(&self, path: &Path) -> ExtractionResult {
        match std::fs::read(path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => ExtractionResult {
                    text,
                    metadata: HashMap::new(),
                    skip_reason: None,
                },
                Err(_) => ExtractionResult::skipped("non-utf8 content"),
            },
            Err(e) => ExtractionResult::skipped(format!("read error: {e}")),
        }
    }
}

/// Dispatches extraction to a per-doctype extractor, falling back to a
/// default when none is registered.
pub struct ExtractionFacade {
    by_doctype: HashMap<String, Arc<dyn TextExtractor>>,
    default: Arc<dyn TextExtractor>,
}

impl ExtractionFacade {
    pub fn new(default: Arc<dyn TextExtractor>) -> Self {
        Self {
            by_doctype: HashMap::new(),
            default,
        }
    }

    /// Plain-text facade: `txt`, `md`, `log`, `csv`, `json` use
    /// [`NullExtractor`]; anything else is skipped.
    pub fn plain_text_only() -> Self {
        let mut facade = Self::new(Arc::new(SkipAll));
        let null = Arc::new(NullExtractor) as Arc<dyn TextExtractor>;
        for doctype in ["txt", "md", "log", "csv", "json"] {
            facade.register(doctype, null.clone());
        }
        facade
    }

    pub fn register(&mut self, doctype: impl Into<String>, extractor: Arc<dyn TextExtractor>) {
        self.by_doctype.insert(doctype.into(), extractor);
    }

    /// Extract text for `meta`. Never returns an error: a failing or
    /// unregistered extractor yields an [`ExtractionResult`] with
    /// `skip_reason` set.
    pub fn extract(&self, meta: &DocumentMetadata) -> ExtractionResult {
        let extractor = self
            .by_doctype
            .get(&meta.doctype)
            .unwrap_or(&self.default);

        match catch_unwind(AssertUnwindSafe(|| extractor.extract(&meta.path))) {
            Ok(result) => result,
            Err(_) => {
                warn!(doctype = %meta.doctype, path = %meta.path.display(), "extractor panicked");
                ExtractionResult::skipped(format!("extractor panicked for doctype '{}'", meta.doctype))
            }
        }
    }
}

struct SkipAll;
impl TextExtractor for SkipAll {
    fn extract(&self, _path: &Path) -> ExtractionResult {
        ExtractionResult::skipped("no extractor registered for this doctype")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn meta(path: PathBuf, doctype: &str) -> DocumentMetadata {
        DocumentMetadata {
            sha256: "0".repeat(64),
            path,
            size_bytes: 0,
            mtime: Utc::now(),
            custodian: None,
            doctype: doctype.to_string(),
        }
    }

    #[test]
    fn reads_plain_text() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "hello world").unwrap();

        let facade = ExtractionFacade::plain_text_only();
        let result = facade.extract(&meta(path, "txt"));
        assert_eq!(result.text, "hello world");
        assert!(!result.is_skipped());
    }

    #[test]
    fn unregistered_doctype_skips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.bin");
        std::fs::write(&path, [0u8, 159, 146, 150]).unwrap();

        let facade = ExtractionFacade::plain_text_only();
        let result = facade.extract(&meta(path, "bin"));
        assert!(result.is_skipped());
        assert_eq!(result.text, "");
    }

    #[test]
    fn non_utf8_text_file_skips_without_panicking() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();

        let facade = ExtractionFacade::plain_text_only();
        let result = facade.extract(&meta(path, "txt"));
        assert!(result.is_skipped());
    }
}

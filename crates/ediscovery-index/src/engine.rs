//! tantivy-backed BM25 full-text engine.
//!
//! One [`IndexEngine`] owns exclusive write access to an index directory
//! for the life of the process (§4.5, §5 ownership rules); readers go
//! through the shared [`tantivy::IndexReader`] snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde_json::Value as JsonValue;
use tantivy::query::QueryParser;
use tantivy::schema::{Schema, TantivyDocument, Value as _, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Term};
use thiserror::Error;

const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid index directory: {0}")]
    OpenDirectory(#[from] tantivy::directory::error::OpenDirectoryError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] ediscovery_ledger::LedgerError),
}

#[derive(Debug, Clone, Copy)]
pub struct IndexFields {
    pub sha256: tantivy::schema::Field,
    pub path: tantivy::schema::Field,
    pub custodian: tantivy::schema::Field,
    pub doctype: tantivy::schema::Field,
    pub text: tantivy::schema::Field,
    pub metadata: tantivy::schema::Field,
}

fn build_schema() -> (Schema, IndexFields) {
    let mut builder = Schema::builder();
    let sha256 = builder.add_text_field("sha256", STRING | STORED);
    let path = builder.add_text_field("path", STORED);
    let custodian = builder.add_text_field("custodian", STRING | STORED);
    let doctype = builder.add_text_field("doctype", STRING | STORED);
    let text = builder.add_text_field("text", TEXT | STORED);
    let metadata = builder.add_text_field("metadata", STORED);
    let schema = builder.build();
    (schema, IndexFields { sha256, path, custodian, doctype, text, metadata })
}

/// A single committed document as read back from the engine.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub sha256: String,
    pub path: String,
    pub custodian: Option<String>,
    pub doctype: String,
}

pub struct IndexEngine {
    index: Index,
    fields: IndexFields,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
}

impl IndexEngine {
    /// Opens an existing index at `index_dir`, creating one with the fixed
    /// schema if the directory is empty.
    pub fn open_or_create(index_dir: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(index_dir)?;
        let (schema, fields) = build_schema();
        let dir = tantivy::directory::MmapDirectory::open(index_dir)?;
        let index = Index::open_or_create(dir, schema)?;
        let writer: IndexWriter = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        Ok(Self { index, fields, writer: Mutex::new(writer), reader })
    }

    pub fn fields(&self) -> &IndexFields {
        &self.fields
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn reader(&self) -> &IndexReader {
        &self.reader
    }

    pub fn query_parser(&self) -> QueryParser {
        QueryParser::for_index(&self.index, vec![self.fields.text])
    }

    /// Adds (or atomically replaces, by `sha256`) a document. Staged in the
    /// writer's buffer; not durable until [`Self::commit`].
    pub fn add_document(
        &self,
        sha256: &str,
        path: &str,
        custodian: Option<&str>,
        doctype: &str,
        text: &str,
        metadata: &HashMap<String, JsonValue>,
    ) -> Result<(), IndexError> {
        let writer = self.writer.lock().expect("index writer mutex poisoned");
        writer.delete_term(Term::from_field_text(self.fields.sha256, sha256));

        let metadata_json = serde_json::to_string(metadata).unwrap_or_default();
        let mut document = TantivyDocument::default();
        document.add_text(self.fields.sha256, sha256);
        document.add_text(self.fields.path, path);
        if let Some(custodian) = custodian {
            document.add_text(self.fields.custodian, custodian);
        }
        document.add_text(self.fields.doctype, doctype);
        document.add_text(self.fields.text, text);
        document.add_text(self.fields.metadata, metadata_json);
        writer.add_document(document)?;
        Ok(())
    }

    /// Flushes staged documents to disk and reloads the reader snapshot.
    pub fn commit(&self) -> Result<(), IndexError> {
        let mut writer = self.writer.lock().expect("index writer mutex poisoned");
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn committed_document_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Scans every committed document; used to rebuild a corrupted metadata
    /// cache (§4.6) without re-running extraction.
    pub fn scan_all(&self) -> Result<Vec<StoredDocument>, IndexError> {
        let searcher = self.reader.searcher();
        let mut out = Vec::with_capacity(searcher.num_docs() as usize);
        for segment_reader in searcher.segment_readers() {
            let store = segment_reader.get_store_reader(0)?;
            for doc_id in 0..segment_reader.max_doc() {
                if segment_reader.is_deleted(doc_id) {
                    continue;
                }
                let doc: TantivyDocument = store.get(doc_id)?;
                let sha256 = field_text(&doc, self.fields.sha256).unwrap_or_default();
                let path = field_text(&doc, self.fields.path).unwrap_or_default();
                let custodian = field_text(&doc, self.fields.custodian);
                let doctype = field_text(&doc, self.fields.doctype).unwrap_or_default();
                out.push(StoredDocument { sha256, path, custodian, doctype });
            }
        }
        Ok(out)
    }
}

pub(crate) fn field_text(doc: &TantivyDocument, field: tantivy::schema::Field) -> Option<String> {
    doc.get_first(field).and_then(|v| v.as_str()).map(str::to_string)
}

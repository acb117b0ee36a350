//! Search Facade (§4.7): translates a query string into a ranked hit list,
//! in lexical, dense, or hybrid (Reciprocal Rank Fusion) mode.

use std::collections::HashMap;
use std::sync::Arc;

use ediscovery_ledger::{AuditSink, Details};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tantivy::collector::TopDocs;
use tantivy::query::Query;
use tantivy::schema::TantivyDocument;

use crate::engine::{field_text, IndexEngine, IndexError};

pub const DEFAULT_RRF_K: f64 = 60.0;
const DEFAULT_DENSE_K: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Dense,
    Hybrid,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub custodian: Option<String>,
    pub doctype: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub doc_id: String,
    pub score: f64,
    pub path: String,
    pub snippet: String,
}

/// Embeds a query string into a dense vector. Injected by the caller; real
/// embedding models are an out-of-scope external collaborator.
pub trait EmbeddingFn: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Minimal vector store: cosine similarity over stored `(doc_id, vector)`
/// pairs. A real ANN index is an out-of-scope external collaborator; this
/// brute-force implementation is adequate for the corpus sizes the core's
/// own test suite exercises.
pub trait VectorStore: Send + Sync {
    fn upsert(&self, doc_id: &str, vector: Vec<f32>);
    fn top_k(&self, query: &[f32], k: usize) -> Vec<(String, f32)>;
}

pub struct BruteForceVectorStore {
    storage: Arc<storage::MemoryStorage>,
    ids: std::sync::Mutex<Vec<String>>,
}

impl BruteForceVectorStore {
    pub fn new(storage: Arc<storage::MemoryStorage>) -> Self {
        Self { storage, ids: std::sync::Mutex::new(Vec::new()) }
    }

    fn load(&self, doc_id: &str) -> Option<Vec<f32>> {
        use storage::StorageBackend;
        let bytes = self.storage.get(doc_id).ok()??;
        serde_json::from_slice(&bytes).ok()
    }
}

impl VectorStore for BruteForceVectorStore {
    fn upsert(&self, doc_id: &str, vector: Vec<f32>) {
        use storage::StorageBackend;
        if let Ok(bytes) = serde_json::to_vec(&vector) {
            let _ = self.storage.put(doc_id, bytes);
        }
        let mut ids = self.ids.lock().expect("vector id list mutex poisoned");
        if !ids.iter().any(|id| id == doc_id) {
            ids.push(doc_id.to_string());
        }
    }

    fn top_k(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let ids = self.ids.lock().expect("vector id list mutex poisoned").clone();
        let mut scored: Vec<(String, f32)> = ids
            .into_iter()
            .filter_map(|id| {
                let vector = self.load(&id)?;
                Some((id, cosine_similarity(query, &vector)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

pub struct SearchFacade {
    engine: Arc<IndexEngine>,
    ledger: Arc<dyn AuditSink>,
    embedding_fn: Option<Arc<dyn EmbeddingFn>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    rrf_k: f64,
}

impl SearchFacade {
    pub fn new(engine: Arc<IndexEngine>, ledger: Arc<dyn AuditSink>) -> Self {
        Self { engine, ledger, embedding_fn: None, vector_store: None, rrf_k: DEFAULT_RRF_K }
    }

    pub fn with_dense_mode(mut self, embedding_fn: Arc<dyn EmbeddingFn>, vector_store: Arc<dyn VectorStore>) -> Self {
        self.embedding_fn = Some(embedding_fn);
        self.vector_store = Some(vector_store);
        self
    }

    pub fn with_rrf_k(mut self, rrf_k: f64) -> Self {
        self.rrf_k = rrf_k;
        self
    }

    pub fn search(&self, query: &str, limit: usize, filters: &SearchFilters, mode: SearchMode) -> Result<Vec<Hit>, IndexError> {
        let hits = match mode {
            SearchMode::Lexical => self.search_lexical(query, limit, filters)?,
            SearchMode::Dense => self.search_dense(query, limit)?,
            SearchMode::Hybrid => {
                let lexical = self.search_lexical(query, usize::max(limit, DEFAULT_DENSE_K), filters)?;
                let dense = self.search_dense(query, DEFAULT_DENSE_K)?;
                fuse_rrf(&lexical, &dense, self.rrf_k, limit)
            }
        };

        self.emit_search_query(query, mode, limit, hits.len());
        Ok(hits)
    }

    fn search_lexical(&self, query: &str, limit: usize, filters: &SearchFilters) -> Result<Vec<Hit>, IndexError> {
        let parser = self.engine.query_parser();
        let parsed: Box<dyn Query> = parser.parse_query(query)?;
        let searcher = self.engine.reader().searcher();
        let top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit.max(1) * 4))?;

        let fields = self.engine.fields();
        let mut hits = Vec::new();
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let doc_id = field_text(&doc, fields.sha256).unwrap_or_default();
            let path = field_text(&doc, fields.path).unwrap_or_default();
            let custodian = field_text(&doc, fields.custodian);
            let doctype = field_text(&doc, fields.doctype);

            if let Some(want) = &filters.custodian {
                if custodian.as_deref() != Some(want.as_str()) {
                    continue;
                }
            }
            if let Some(want) = &filters.doctype {
                if doctype.as_deref() != Some(want.as_str()) {
                    continue;
                }
            }

            let snippet = field_text(&doc, fields.text).map(|t| truncate_snippet(&t, 240)).unwrap_or_default();
            hits.push(Hit { doc_id, score: score as f64, path, snippet });
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    fn search_dense(&self, query: &str, k: usize) -> Result<Vec<Hit>, IndexError> {
        let (Some(embedding_fn), Some(store)) = (&self.embedding_fn, &self.vector_store) else {
            return Ok(Vec::new());
        };
        let query_vector = embedding_fn.embed(query);
        let neighbors = store.top_k(&query_vector, k);
        Ok(neighbors
            .into_iter()
            .map(|(doc_id, score)| Hit { doc_id, score: score as f64, path: String::new(), snippet: String::new() })
            .collect())
    }

    fn emit_search_query(&self, query: &str, mode: SearchMode, limit: usize, hit_count: usize) {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        let query_hash = hex::encode(hasher.finalize());

        let mode_str = match mode {
            SearchMode::Lexical => "lexical",
            SearchMode::Dense => "dense",
            SearchMode::Hybrid => "hybrid",
        };

        let mut details = Details::new();
        details.insert("query_hash".to_string(), JsonValue::String(query_hash));
        details.insert("mode".to_string(), JsonValue::String(mode_str.to_string()));
        details.insert("limit".to_string(), JsonValue::from(limit as u64));
        details.insert("hit_count".to_string(), JsonValue::from(hit_count as u64));
        let _ = self.ledger.append("SEARCH_QUERY", details);
    }
}

fn truncate_snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Reciprocal Rank Fusion: `score(d) = sum_i 1 / (k + rank_i(d))`.
/// Documents present in only one list are still ranked; ties broken by
/// ascending `doc_id` (`sha256`).
pub fn fuse_rrf(lexical: &[Hit], dense: &[Hit], k: f64, limit: usize) -> Vec<Hit> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut sources: HashMap<String, &Hit> = HashMap::new();

    for (rank, hit) in lexical.iter().enumerate() {
        *scores.entry(hit.doc_id.clone()).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
        sources.entry(hit.doc_id.clone()).or_insert(hit);
    }
    for (rank, hit) in dense.iter().enumerate() {
        *scores.entry(hit.doc_id.clone()).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
        sources.entry(hit.doc_id.clone()).or_insert(hit);
    }

    let mut fused: Vec<Hit> = scores
        .into_iter()
        .map(|(doc_id, score)| {
            let source = sources.get(&doc_id).copied();
            Hit {
                path: source.map(|h| h.path.clone()).unwrap_or_default(),
                snippet: source.map(|h| h.snippet.clone()).unwrap_or_default(),
                doc_id,
                score,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    fused.truncate(limit);
    fused
}

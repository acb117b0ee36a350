//! Index Writer coordinator (§4.5): drives a lazy discovery stream through
//! extraction workers into the full-text engine and metadata cache, one
//! batch commit at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ediscovery_discovery::{DiscoveryWarning, DocumentMetadata};
use ediscovery_ledger::{AuditSink, Details};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::cache::{CommittedBatch, MetadataCache};
use crate::engine::{IndexError, IndexEngine};
use crate::pool::{ExtractionJob, PoolEvent, WorkerPool};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub indexed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

struct BatchAccumulator {
    custodians: Vec<Option<String>>,
    doctypes: Vec<String>,
    batch_size: usize,
}

impl BatchAccumulator {
    fn new(batch_size: usize) -> Self {
        Self { custodians: Vec::new(), doctypes: Vec::new(), batch_size: batch_size.max(1) }
    }

    fn push(&mut self, custodian: Option<String>, doctype: String) {
        self.custodians.push(custodian);
        self.doctypes.push(doctype);
    }

    fn is_full(&self) -> bool {
        self.doctypes.len() >= self.batch_size
    }

    fn is_empty(&self) -> bool {
        self.doctypes.is_empty()
    }

    fn take(&mut self) -> (Vec<Option<String>>, Vec<String>) {
        (std::mem::take(&mut self.custodians), std::mem::take(&mut self.doctypes))
    }
}

/// Builds a full-text index from `stream`, driving `pool` to extract text
/// in isolated workers. Returns once the stream is exhausted and a final
/// commit has been made.
pub fn build<P: WorkerPool>(
    stream: impl Iterator<Item = Result<DocumentMetadata, DiscoveryWarning>>,
    engine: &IndexEngine,
    cache: &mut MetadataCache,
    ledger: &Arc<dyn AuditSink>,
    pool: &mut P,
    workers: usize,
    batch_size: usize,
) -> Result<BuildReport, IndexError> {
    let started = Instant::now();
    let queue_capacity = crate::pool::default_queue_capacity(workers);
    let mut in_flight_meta: HashMap<String, DocumentMetadata> = HashMap::new();
    let mut batch = BatchAccumulator::new(batch_size);

    let mut indexed: u64 = 0;
    let mut skipped: u64 = 0;
    let mut errors: u64 = 0;
    let mut cumulative: u64 = 0;

    macro_rules! drain_one {
        () => {
            match pool.recv() {
                Some(PoolEvent::Outcome(outcome)) => {
                    let Some(meta) = in_flight_meta.remove(&outcome.sha256) else { continue };
                    if let Some(reason) = outcome.skip_reason {
                        skipped += 1;
                        let mut details = Details::new();
                        details.insert("path".to_string(), JsonValue::String(meta.path.display().to_string()));
                        details.insert("reason".to_string(), JsonValue::String(reason));
                        let _ = ledger.append("EXTRACTION_SKIPPED", details);
                    } else {
                        engine.add_document(
                            &meta.sha256,
                            &meta.path.display().to_string(),
                            meta.custodian.as_deref(),
                            &meta.doctype,
                            &outcome.text,
                            &outcome.metadata,
                        )?;
                        indexed += 1;
                        cumulative += 1;
                        batch.push(meta.custodian.clone(), meta.doctype.clone());
                        if batch.is_full() {
                            commit_batch(engine, cache, ledger, &mut batch, cumulative)?;
                        }
                    }
                }
                Some(PoolEvent::Crash(crash)) => {
                    skipped += 1;
                    errors += 1;
                    in_flight_meta.remove(&crash.sha256);
                    let mut details = Details::new();
                    details.insert("path".to_string(), JsonValue::String(crash.path.display().to_string()));
                    details.insert("reason".to_string(), JsonValue::String(crash.reason));
                    let _ = ledger.append("EXTRACTION_FAILED", details);
                }
                None => break,
            }
        };
    }

    for item in stream {
        match item {
            Ok(meta) => {
                while pool.in_flight() >= queue_capacity {
                    drain_one!();
                }
                in_flight_meta.insert(meta.sha256.clone(), meta.clone());
                pool.submit(ExtractionJob { sha256: meta.sha256, path: meta.path, doctype: meta.doctype })?;
            }
            Err(DiscoveryWarning::Traversal { .. }) => {
                // Path Guard already recorded PATH_TRAVERSAL_ATTEMPT.
                errors += 1;
            }
            Err(DiscoveryWarning::ReadError { path, reason }) => {
                errors += 1;
                let mut details = Details::new();
                details.insert("path".to_string(), JsonValue::String(path));
                details.insert("reason".to_string(), JsonValue::String(reason));
                let _ = ledger.append("DISCOVERY_READ_ERROR", details);
            }
        }
    }

    while pool.in_flight() > 0 {
        drain_one!();
    }
    pool.close();

    if !batch.is_empty() {
        commit_batch(engine, cache, ledger, &mut batch, cumulative)?;
    } else {
        engine.commit()?;
    }
    cache.flush()?;

    let mut complete = Details::new();
    complete.insert("indexed".to_string(), JsonValue::from(indexed));
    complete.insert("skipped".to_string(), JsonValue::from(skipped));
    ledger.append("INDEX_BUILD_COMPLETE", complete)?;

    info!(indexed, skipped, errors, "index build complete");
    Ok(BuildReport { indexed, skipped, errors, elapsed: started.elapsed() })
}

fn commit_batch(
    engine: &IndexEngine,
    cache: &mut MetadataCache,
    ledger: &Arc<dyn AuditSink>,
    batch: &mut BatchAccumulator,
    cumulative: u64,
) -> Result<(), IndexError> {
    engine.commit()?;
    let (custodians, doctypes) = batch.take();
    let count = doctypes.len() as u64;
    cache.update_for_batch(CommittedBatch { custodians: &custodians, doctypes: &doctypes });
    cache.flush()?;

    let last_hash = ledger.append(
        "INDEX_BATCH_COMMIT",
        {
            let mut d = Details::new();
            d.insert("count".to_string(), JsonValue::from(count));
            d.insert("cumulative".to_string(), JsonValue::from(cumulative));
            d
        },
    );
    if let Ok(hash) = last_hash {
        warn!(hash = %hash, count, cumulative, "batch committed");
    }
    Ok(())
}

/// Aborts the build, emitting `INDEX_BUILD_ABORT{cause}`. Called when a
/// commit failure makes continuing unsafe; the prior committed state
/// remains queryable.
pub fn abort(ledger: &Arc<dyn AuditSink>, cause: &str) {
    let mut details = Details::new();
    details.insert("cause".to_string(), JsonValue::String(cause.to_string()));
    let _ = ledger.append("INDEX_BUILD_ABORT", details);
}

/// Emits `INDEX_BUILD_CANCELLED` after draining in-flight jobs and
/// committing whatever has accumulated (§5 cancellation semantics).
pub fn cancelled(ledger: &Arc<dyn AuditSink>, indexed: u64, skipped: u64) {
    let mut details = Details::new();
    details.insert("indexed".to_string(), JsonValue::from(indexed));
    details.insert("skipped".to_string(), JsonValue::from(skipped));
    let _ = ledger.append("INDEX_BUILD_CANCELLED", details);
}

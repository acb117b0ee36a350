//! Orchestration facade: owns the persistent `data_root` (ledger, index,
//! metadata cache) for the lifetime of a process and exposes the pipeline's
//! public surface — `build`, `search`, and privilege classification — as
//! plain synchronous calls. No cooperative task runtime is visible here;
//! the one place `tokio` appears is `ediscovery_model_adapter`.

pub mod config;
pub mod error;

use std::sync::{Arc, Mutex};

use ediscovery_extraction::ExtractionFacade;
use ediscovery_ledger::AuditLedger;
use ediscovery_index::{
    BuildReport, IndexEngine, MetadataCache, ProcessWorkerPool, SearchFacade, SearchFilters,
    SearchMode, ThreadPoolWorkerPool, WorkerPool,
};
use ediscovery_path_guard::PathGuard;
use ediscovery_privilege::{Policy, PrivilegeConfig, PrivilegeService};
use tracing::instrument;

pub use config::EdiscoveryConfig;
pub use error::EdiscoveryError;

/// Owns the persistent state under `config.data_root`: the audit ledger,
/// the full-text engine, and the metadata cache. A corpus to ingest
/// (`corpus_root` passed to [`Self::build`]) is a separate, per-call
/// concern — it is not fixed at `open` time, since the same persistent
/// store can ingest documents from more than one corpus directory over
/// its lifetime.
pub struct EdiscoveryCore {
    config: EdiscoveryConfig,
    ledger: Arc<AuditLedger>,
    engine: Arc<IndexEngine>,
    cache: Mutex<MetadataCache>,
}

impl EdiscoveryCore {
    /// Opens (creating if absent) the persistent state at
    /// `config.data_root`. Refuses to open over a ledger with a broken hash
    /// chain (§4.2).
    #[instrument(skip_all, fields(data_root = %config.data_root.display()))]
    pub fn open(config: EdiscoveryConfig) -> Result<Self, EdiscoveryError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_root)?;

        let ledger = Arc::new(AuditLedger::open(config.ledger_path())?);
        let engine = Arc::new(IndexEngine::open_or_create(&config.index_dir())?);
        let cache = Mutex::new(MetadataCache::open(config.metadata_cache_path()));

        Ok(Self { config, ledger, engine, cache })
    }

    pub fn config(&self) -> &EdiscoveryConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &Arc<IndexEngine> {
        &self.engine
    }

    pub fn doc_count(&self) -> u64 {
        self.cache.lock().expect("metadata cache mutex poisoned").doc_count()
    }

    /// Builds (ingests) every new document under `corpus_root` into the
    /// index, using an in-process thread pool for extraction. Suitable for
    /// tests and small/trusted corpora; production ingestion that needs
    /// real process isolation should use [`Self::build_with_process_workers`].
    pub fn build(
        &self,
        corpus_root: impl AsRef<std::path::Path>,
        extraction: Arc<ExtractionFacade>,
    ) -> Result<BuildReport, EdiscoveryError> {
        let mut pool = ThreadPoolWorkerPool::new(self.config.workers, extraction);
        self.build_with_pool(corpus_root, &mut pool)
    }

    /// Builds using the production, process-isolated worker pool (§5:
    /// "process isolation, not threads"). `worker_binary` is the path to a
    /// binary speaking the `ediscovery_extraction::worker_protocol` framing
    /// on stdin/stdout (see the `extraction-worker` binary).
    pub fn build_with_process_workers(
        &self,
        corpus_root: impl AsRef<std::path::Path>,
        worker_binary: &std::path::Path,
    ) -> Result<BuildReport, EdiscoveryError> {
        let mut pool = ProcessWorkerPool::spawn(worker_binary, self.config.workers)?;
        self.build_with_pool(corpus_root, &mut pool)
    }

    /// Generic entry point over any [`WorkerPool`] implementation: creates a
    /// fresh [`PathGuard`] scoped to `corpus_root` (the ingest directory,
    /// distinct from the persistent `data_root`), discovers documents under
    /// it, and drives them through `pool` into the index and cache.
    pub fn build_with_pool<P: WorkerPool>(
        &self,
        corpus_root: impl AsRef<std::path::Path>,
        pool: &mut P,
    ) -> Result<BuildReport, EdiscoveryError> {
        let guard = Arc::new(PathGuard::new(corpus_root.as_ref(), self.ledger.clone())?);
        let ledger_sink: Arc<dyn ediscovery_ledger::AuditSink> = self.ledger.clone();
        let stream = ediscovery_discovery::discover(corpus_root.as_ref(), guard, ledger_sink.clone(), true);

        let mut cache = self.cache.lock().expect("metadata cache mutex poisoned");
        let report = ediscovery_index::build(
            stream,
            &self.engine,
            &mut cache,
            &ledger_sink,
            pool,
            self.config.workers,
            self.config.batch_size,
        )?;
        Ok(report)
    }

    /// Rebuilds the metadata cache from a full scan of the index (§4.6,
    /// used when the on-disk cache file is missing or corrupt and a
    /// recovery pass is requested explicitly rather than happening
    /// silently on open).
    pub fn rebuild_cache(&self) -> Result<(), EdiscoveryError> {
        let documents = self.engine.scan_all()?;
        let doc_count = documents.len() as u64;
        let custodians = documents.iter().map(|d| d.custodian.clone());
        let doctypes = documents.iter().map(|d| d.doctype.clone());
        let mut rebuilt = MetadataCache::rebuild_from(self.config.metadata_cache_path(), custodians, doctypes, doc_count);
        rebuilt.flush()?;
        *self.cache.lock().expect("metadata cache mutex poisoned") = rebuilt;
        Ok(())
    }

    /// A [`SearchFacade`] bound to this store's engine and ledger. Cheap to
    /// construct; callers may build one per query or hold onto it.
    pub fn search_facade(&self) -> SearchFacade {
        SearchFacade::new(self.engine.clone(), self.ledger.clone()).with_rrf_k(self.config.search.rrf_k)
    }

    pub fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
        mode: SearchMode,
    ) -> Result<Vec<ediscovery_index::Hit>, EdiscoveryError> {
        Ok(self.search_facade().search(query, limit, filters, mode)?)
    }

    /// Loads a [`PrivilegeService`] bound to this store's ledger from a
    /// policy file on disk. Refuses to start (`PolicyMissing`, §7) if the
    /// policy path is absent or unreadable; does not block other
    /// components.
    pub fn privilege_service(
        &self,
        policy_path: impl AsRef<std::path::Path>,
    ) -> Result<PrivilegeService, EdiscoveryError> {
        let config = PrivilegeConfig {
            threshold_high: self.config.privilege.threshold_high,
            threshold_low: self.config.privilege.threshold_low,
            reasoning_effort: self.config.privilege.reasoning_effort.into(),
            log_full_cot: self.config.privilege.log_full_cot,
        };
        Ok(PrivilegeService::from_policy_file(policy_path, config, self.ledger.clone())?)
    }

    /// Same as [`Self::privilege_service`] but from an already-loaded
    /// [`Policy`], for callers that compiled it themselves (e.g. to
    /// inspect `policy_version` before committing to a run).
    pub fn privilege_service_from_policy(&self, policy: Policy) -> PrivilegeService {
        let config = PrivilegeConfig {
            threshold_high: self.config.privilege.threshold_high,
            threshold_low: self.config.privilege.threshold_low,
            reasoning_effort: self.config.privilege.reasoning_effort.into(),
            log_full_cot: self.config.privilege.log_full_cot,
        };
        PrivilegeService::new(policy, config, self.ledger.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ediscovery_extraction::ExtractionFacade;
    use tempfile::TempDir;

    fn open_core() -> (EdiscoveryCore, TempDir) {
        let data_dir = TempDir::new().unwrap();
        let config = EdiscoveryConfig::new(data_dir.path());
        let core = EdiscoveryCore::open(config).unwrap();
        (core, data_dir)
    }

    #[test]
    fn open_creates_empty_ledger_and_index() {
        let (core, _data_dir) = open_core();
        assert_eq!(core.ledger().entry_count(), 0);
        assert_eq!(core.engine().committed_document_count(), 0);
        assert_eq!(core.doc_count(), 0);
    }

    #[test]
    fn build_over_empty_corpus_yields_nothing() {
        let (core, _data_dir) = open_core();
        let corpus = TempDir::new().unwrap();
        let report = core.build(corpus.path(), Arc::new(ExtractionFacade::plain_text_only())).unwrap();
        assert_eq!(report.indexed, 0);
        assert_eq!(core.doc_count(), 0);
    }

    #[test]
    fn build_indexes_plain_text_documents_and_they_become_searchable() {
        let (core, _data_dir) = open_core();
        let corpus = TempDir::new().unwrap();
        std::fs::write(corpus.path().join("memo.txt"), "a routine business memo about quarterly results").unwrap();

        let report = core.build(corpus.path(), Arc::new(ExtractionFacade::plain_text_only())).unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(core.doc_count(), 1);

        let hits = core
            .search("quarterly", 10, &SearchFilters::default(), SearchMode::Lexical)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn rejects_invalid_config() {
        let data_dir = TempDir::new().unwrap();
        let mut config = EdiscoveryConfig::new(data_dir.path());
        config.workers = 0;
        assert!(matches!(EdiscoveryCore::open(config), Err(EdiscoveryError::Usage(_))));
    }
}

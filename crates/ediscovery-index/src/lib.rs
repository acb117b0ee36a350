//! Parallel Index Builder: full-text engine, worker pool, metadata cache,
//! batch-commit writer coordinator, and the search facade built on top of
//! them (§4.5–§4.7).

pub mod cache;
pub mod engine;
pub mod pool;
pub mod search;
pub mod writer;

pub use cache::{CommittedBatch, MetadataCache, CACHE_SCHEMA_VERSION};
pub use engine::{IndexEngine, IndexError, IndexFields, StoredDocument};
pub use pool::{
    default_queue_capacity, ExtractionJob, ExtractionOutcome, PoolEvent, ProcessWorkerPool,
    ThreadPoolWorkerPool, WorkerCrash, WorkerPool,
};
pub use search::{BruteForceVectorStore, EmbeddingFn, Hit, SearchFacade, SearchFilters, SearchMode, VectorStore, DEFAULT_RRF_K};
pub use writer::{abort, build, cancelled, BuildReport};

//! Unified error type for the orchestration facade. Every component error
//! folds in via `#[from]`; nothing downstream needs to match on five
//! different error enums to report a failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdiscoveryError {
    #[error("configuration error: {0}")]
    Usage(String),
    #[error("audit ledger: {0}")]
    Ledger(#[from] ediscovery_ledger::LedgerError),
    #[error("ledger integrity: {0}")]
    LedgerIntegrity(#[from] ediscovery_ledger::LedgerIntegrityError),
    #[error("path guard: {0}")]
    PathGuard(#[from] ediscovery_path_guard::PathGuardError),
    #[error("index: {0}")]
    Index(#[from] ediscovery_index::IndexError),
    #[error("privilege service: {0}")]
    Privilege(#[from] ediscovery_privilege::PrivilegeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

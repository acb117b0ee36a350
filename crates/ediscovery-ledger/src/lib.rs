//! Append-only, hash-chained audit ledger.
//!
//! Every meaningful action taken by the pipeline is recorded as one line of
//! the ledger file. Each entry's `hash` is bound to the previous entry's hash,
//! so any tampering with a past entry is detectable by [`AuditLedger::verify`].
//! Writes are synchronous and fsync'd before `append` returns.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// 64 ASCII zero characters: the `previous_hash` of the first (genesis) entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub type Details = BTreeMap<String, JsonValue>;

/// A single ledger record.
///
/// Field declaration order matches the on-disk field order (§6): `timestamp`,
/// `action`, `details`, `previous_hash`, `hash`. The hash itself is computed
/// over a *separate* canonical (sorted-key, minified) view of the other four
/// fields — see [`canonical_bytes`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: Details,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Recompute the hash this entry *should* have, from its own fields.
    pub fn recompute_hash(&self) -> String {
        hex::encode(Sha256::digest(&canonical_bytes(
            &self.timestamp,
            &self.action,
            &self.details,
            &self.previous_hash,
        )))
    }
}

/// Canonical serialization used only for hashing: a sorted-key, minified JSON
/// object over `{action, details, previous_hash, timestamp}` (the `hash`
/// field itself is never part of its own input).
pub fn canonical_bytes(
    timestamp: &DateTime<Utc>,
    action: &str,
    details: &Details,
    previous_hash: &str,
) -> Vec<u8> {
    let mut canonical: BTreeMap<&str, JsonValue> = BTreeMap::new();
    canonical.insert("action", JsonValue::String(action.to_string()));
    canonical.insert(
        "details",
        JsonValue::Object(details.clone().into_iter().collect()),
    );
    canonical.insert("previous_hash", JsonValue::String(previous_hash.to_string()));
    canonical.insert(
        "timestamp",
        JsonValue::String(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    serde_json::to_vec(&canonical).expect("canonical map serializes")
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ledger durability failure: {0}")]
    Durability(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityErrorKind {
    #[error("recorded hash does not match recomputed hash")]
    BadHash,
    #[error("previous_hash does not link to the prior entry's hash")]
    BrokenLink,
    #[error("first entry's previous_hash is not the genesis constant")]
    MissingGenesis,
}

/// Raised by [`AuditLedger::verify`] / loaded by callers as `LedgerIntegrityError`.
#[derive(Debug, Error)]
#[error("ledger integrity broken at entry {break_at} ({kind})")]
pub struct LedgerIntegrityError {
    /// 1-indexed position of the first offending entry.
    pub break_at: u64,
    pub kind: IntegrityErrorKind,
}

/// Dependency seam every component takes explicitly rather than reaching for
/// a module-level singleton (Design Note §9, "Audit coupling").
pub trait AuditSink: Send + Sync {
    fn append(&self, action: &str, details: Details) -> Result<String, LedgerError>;
}

struct WriterState {
    file: File,
    last_hash: String,
    entry_count: u64,
    last_timestamp: DateTime<Utc>,
}

/// An append-only, hash-chained, fsync-durable event log.
///
/// Holds an exclusive OS-level advisory lock on the underlying file for its
/// entire lifetime (§4.2: "a single writer per process is sufficient").
/// `verify`/`read_range` read through a clone of that same locked handle
/// rather than opening a second file descriptor: a `flock` is held per open
/// file description, so a fresh `File::open` in this process would block
/// forever trying to acquire a shared lock against the writer's own
/// exclusive one. Cloning shares the existing lock instead of contending
/// for a new one, and `append` always repositions to end-of-file (`O_APPEND`)
/// regardless of where a concurrent read left the shared offset.
pub struct AuditLedger {
    path: PathBuf,
    writer: Mutex<WriterState>,
}

impl AuditLedger {
    /// Open (creating if absent) the ledger at `path` for appending.
    ///
    /// If the file already exists its chain is verified first; a broken
    /// chain refuses to open for writing (§4.2: "MUST NOT accept further
    /// appends until an operator acknowledges").
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();

        let (last_hash, entry_count) = if path.exists() {
            match verify_file(&path) {
                Ok((hash, count)) => (hash, count),
                Err(e) => {
                    return Err(LedgerError::Durability(format!(
                        "refusing to open ledger with a broken chain: {e}"
                    )))
                }
            }
        } else {
            (GENESIS_HASH.to_string(), 0)
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.lock_exclusive()?;

        Ok(Self {
            path,
            writer: Mutex::new(WriterState {
                file,
                last_hash,
                entry_count,
                last_timestamp: DateTime::<Utc>::MIN_UTC,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chain_tip(&self) -> String {
        self.writer.lock().unwrap().last_hash.clone()
    }

    pub fn entry_count(&self) -> u64 {
        self.writer.lock().unwrap().entry_count
    }

    /// Compute, write, fsync, and return the new entry's hash (the new chain
    /// tip). Synchronous: does not return until the record is durable.
    #[instrument(skip(self, details), fields(action = %action))]
    pub fn append(&self, action: &str, details: Details) -> Result<String, LedgerError> {
        let mut state = self.writer.lock().unwrap();

        let mut timestamp = Utc::now();
        if timestamp <= state.last_timestamp {
            timestamp = state.last_timestamp + chrono::Duration::microseconds(1);
        }

        let previous_hash = state.last_hash.clone();
        let hash = hex::encode(Sha256::digest(&canonical_bytes(
            &timestamp,
            action,
            &details,
            &previous_hash,
        )));

        let entry = AuditEntry {
            timestamp,
            action: action.to_string(),
            details,
            previous_hash,
            hash: hash.clone(),
        };

        let pre_write_len = state.file.metadata()?.len();
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if let Err(e) = state.file.write_all(&line) {
            truncate_to(&mut state.file, pre_write_len);
            return Err(LedgerError::Durability(format!("write failed: {e}")));
        }
        if let Err(e) = state.file.sync_all() {
            truncate_to(&mut state.file, pre_write_len);
            return Err(LedgerError::Durability(format!("fsync failed: {e}")));
        }

        state.last_hash = hash.clone();
        state.entry_count += 1;
        state.last_timestamp = timestamp;

        debug!(entry_count = state.entry_count, %hash, "ledger entry appended");
        Ok(hash)
    }

    /// Recompute every entry's hash and check chain linkage; reports the
    /// first break found. Reads through the writer's own locked handle, so
    /// it always sees every `append` that preceded it in this process.
    pub fn verify(&self) -> Result<(), LedgerIntegrityError> {
        let state = self.writer.lock().unwrap();
        let reader = cloned_reader_from_start(&state.file).map_err(|e| {
            warn!("cannot seek ledger for verification: {e}");
            LedgerIntegrityError {
                break_at: 0,
                kind: IntegrityErrorKind::MissingGenesis,
            }
        })?;
        verify_reader(reader).map(|_| ())
    }

    /// Read entries `[from, to)` by 0-based position. Reads through the
    /// writer's own locked handle so a successful `append` is immediately
    /// visible here, even while this same `AuditLedger` holds the file's
    /// only (exclusive) lock.
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, LedgerError> {
        let state = self.writer.lock().unwrap();
        let reader = cloned_reader_from_start(&state.file)?;
        let mut out = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let idx = idx as u64;
            if idx < from {
                continue;
            }
            if idx >= to {
                break;
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

/// Clone `file`'s descriptor and seek the clone to the start. The clone
/// shares the original's open file description (and thus its advisory
/// lock), so no new lock needs to be taken to read it.
fn cloned_reader_from_start(file: &File) -> io::Result<BufReader<File>> {
    let mut clone = file.try_clone()?;
    clone.seek(SeekFrom::Start(0))?;
    Ok(BufReader::new(clone))
}

impl AuditSink for AuditLedger {
    fn append(&self, action: &str, details: Details) -> Result<String, LedgerError> {
        AuditLedger::append(self, action, details)
    }
}

fn truncate_to(file: &mut File, len: u64) {
    if let Err(e) = file.set_len(len) {
        warn!("failed to truncate ledger after durability failure: {e}");
    }
    let _ = file.seek(SeekFrom::End(0));
}

/// Open `path` fresh (no existing in-process handle holds its lock yet —
/// this is only called before `AuditLedger::open` has taken the exclusive
/// lock for writing), take a shared lock, and verify the whole chain.
fn verify_file(path: &Path) -> Result<(String, u64), LedgerIntegrityError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("cannot open ledger for verification: {e}");
            return Err(LedgerIntegrityError {
                break_at: 0,
                kind: IntegrityErrorKind::MissingGenesis,
            });
        }
    };
    file.lock_shared().ok();
    let result = verify_reader(BufReader::new(&file));
    let _ = FileExt::unlock(&file);
    result
}

/// Recompute every entry's hash and check chain linkage over `reader`,
/// returning the final chain tip and entry count on success.
fn verify_reader<R: BufRead>(reader: R) -> Result<(String, u64), LedgerIntegrityError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut count: u64 = 0;

    for (zero_based, line) in reader.lines().enumerate() {
        let idx = zero_based as u64 + 1;
        let line = line.map_err(|_| LedgerIntegrityError {
            break_at: idx,
            kind: IntegrityErrorKind::BadHash,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let entry: AuditEntry = serde_json::from_str(&line).map_err(|_| LedgerIntegrityError {
            break_at: idx,
            kind: IntegrityErrorKind::BadHash,
        })?;

        if idx == 1 && entry.previous_hash != GENESIS_HASH {
            return Err(LedgerIntegrityError {
                break_at: idx,
                kind: IntegrityErrorKind::MissingGenesis,
            });
        }
        if entry.previous_hash != expected_prev {
            return Err(LedgerIntegrityError {
                break_at: idx,
                kind: IntegrityErrorKind::BrokenLink,
            });
        }
        if entry.recompute_hash() != entry.hash {
            return Err(LedgerIntegrityError {
                break_at: idx,
                kind: IntegrityErrorKind::BadHash,
            });
        }

        expected_prev = entry.hash.clone();
        count += 1;
    }

    Ok((expected_prev, count))
}

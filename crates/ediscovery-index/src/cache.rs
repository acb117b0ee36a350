//! Metadata cache: O(1) answers for "what custodians/doctypes exist, how
//! many documents are indexed" (§4.6), persisted as a single small JSON
//! document via write-temp-then-rename.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::IndexError;

pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    schema_version: u32,
    custodians: Vec<String>,
    doctypes: Vec<String>,
    doc_count: u64,
    last_updated: DateTime<Utc>,
}

/// A batch of documents just committed to the index; feeds
/// [`MetadataCache::update_for_batch`].
pub struct CommittedBatch<'a> {
    pub custodians: &'a [Option<String>],
    pub doctypes: &'a [String],
}

pub struct MetadataCache {
    path: PathBuf,
    custodians: HashSet<String>,
    doctypes: HashSet<String>,
    doc_count: u64,
    last_updated: DateTime<Utc>,
}

impl MetadataCache {
    /// Loads the cache file at `path`. A missing, corrupt, or
    /// newer-major-version file is treated as an empty cache rather than an
    /// error — the caller rebuilds it by scanning the index.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(file) if file.schema_version == CACHE_SCHEMA_VERSION => Self {
                    path,
                    custodians: file.custodians.into_iter().collect(),
                    doctypes: file.doctypes.into_iter().collect(),
                    doc_count: file.doc_count,
                    last_updated: file.last_updated,
                },
                Ok(file) => {
                    warn!(found = file.schema_version, expected = CACHE_SCHEMA_VERSION, "metadata cache schema mismatch, rebuilding");
                    Self::empty(path)
                }
                Err(e) => {
                    warn!(error = %e, "metadata cache corrupt, rebuilding");
                    Self::empty(path)
                }
            },
            Err(_) => Self::empty(path),
        }
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            custodians: HashSet::new(),
            doctypes: HashSet::new(),
            doc_count: 0,
            last_updated: Utc::now(),
        }
    }

    /// Rebuilds the cache in memory from a full scan of the index's stored
    /// documents (used after a corrupted-cache recovery run, §8 property 5).
    pub fn rebuild_from(path: impl Into<PathBuf>, custodians: impl IntoIterator<Item = Option<String>>, doctypes: impl IntoIterator<Item = String>, doc_count: u64) -> Self {
        Self {
            path: path.into(),
            custodians: custodians.into_iter().flatten().collect(),
            doctypes: doctypes.into_iter().collect(),
            doc_count,
            last_updated: Utc::now(),
        }
    }

    pub fn get_custodians(&self) -> &HashSet<String> {
        &self.custodians
    }

    pub fn get_doctypes(&self) -> &HashSet<String> {
        &self.doctypes
    }

    pub fn doc_count(&self) -> u64 {
        self.doc_count
    }

    pub fn update_for_batch(&mut self, batch: CommittedBatch<'_>) {
        for custodian in batch.custodians.iter().flatten() {
            self.custodians.insert(custodian.clone());
        }
        for doctype in batch.doctypes {
            self.doctypes.insert(doctype.clone());
        }
        self.doc_count += batch.doctypes.len() as u64;
        self.last_updated = Utc::now();
    }

    /// Atomically persists the cache: write to a temp file in the same
    /// directory, fsync it, then rename over the target.
    pub fn flush(&mut self) -> Result<(), IndexError> {
        self.last_updated = Utc::now();
        let file = CacheFile {
            schema_version: CACHE_SCHEMA_VERSION,
            custodians: sorted(&self.custodians),
            doctypes: sorted(&self.doctypes),
            doc_count: self.doc_count,
            last_updated: self.last_updated,
        };
        let bytes = serde_json::to_vec(&file)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp_path = dir.join(format!(".{}.tmp", file_name(&self.path)));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.iter().cloned().collect();
    v.sort();
    v
}

fn file_name(path: &Path) -> String {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("metadata_cache.json").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_open_then_update_then_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata_cache.json");

        let mut cache = MetadataCache::open(&path);
        assert_eq!(cache.doc_count(), 0);

        let custodians = vec![Some("smith".to_string()), None];
        let doctypes = vec!["txt".to_string(), "eml".to_string()];
        cache.update_for_batch(CommittedBatch { custodians: &custodians, doctypes: &doctypes });
        cache.flush().unwrap();

        let reloaded = MetadataCache::open(&path);
        assert_eq!(reloaded.doc_count(), 2);
        assert!(reloaded.get_custodians().contains("smith"));
        assert!(reloaded.get_doctypes().contains("txt"));
    }

    #[test]
    fn corrupt_file_yields_empty_cache() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata_cache.json");
        std::fs::write(&path, b"not json").unwrap();

        let cache = MetadataCache::open(&path);
        assert_eq!(cache.doc_count(), 0);
    }
}

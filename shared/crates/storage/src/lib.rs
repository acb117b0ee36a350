// Shared Storage Layer

//! # Storage
//!
//! Minimal synchronous key-value abstraction shared across the core's
//! components that need a small persisted or in-memory map (the Search
//! Facade's vector store is the current consumer).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

/// Storage backend trait. Synchronous: callers in the core run on the
/// coordinator's own thread, never inside an async runtime.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    fn exists(&self, key: &str) -> Result<bool, StorageError>;
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory storage implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut data = self.data.write().map_err(|_| StorageError::LockPoisoned)?;
        data.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().map_err(|_| StorageError::LockPoisoned)?;
        data.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(data.contains_key(key))
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(data.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

/// Convenience wrapper for storing/loading serde types through a backend.
pub struct StorageManager<T: StorageBackend> {
    backend: T,
}

impl<T: StorageBackend> StorageManager<T> {
    pub fn new(backend: T) -> Self {
        StorageManager { backend }
    }

    pub fn store_json<V: Serialize>(&self, key: &str, value: &V) -> Result<(), StorageError> {
        let json = serde_json::to_vec(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.backend.put(key, json)
    }

    pub fn load_json<V: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<V>, StorageError> {
        match self.backend.get(key)? {
            Some(data) => {
                let value = serde_json::from_slice(&data).map_err(|e| StorageError::SerializationError(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.backend.delete(key)
    }

    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.backend.exists(key)
    }

    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.backend.list_keys(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.put("test_key", b"test_value".to_vec()).unwrap();
        assert_eq!(storage.get("test_key").unwrap().unwrap(), b"test_value");
        assert!(storage.exists("test_key").unwrap());
        assert!(!storage.exists("nonexistent").unwrap());
        storage.delete("test_key").unwrap();
        assert!(!storage.exists("test_key").unwrap());
    }

    #[test]
    fn storage_manager_json_roundtrip() {
        let storage = MemoryStorage::new();
        let manager = StorageManager::new(storage);

        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct TestData {
            id: Uuid,
            name: String,
        }

        let test_data = TestData { id: Uuid::new_v4(), name: "test".to_string() };
        manager.store_json("test_json", &test_data).unwrap();
        let loaded: TestData = manager.load_json("test_json").unwrap().unwrap();
        assert_eq!(loaded, test_data);
    }
}

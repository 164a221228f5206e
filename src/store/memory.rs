use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use super::{BlobStore, Collection, DocumentStore};
use crate::error::PersistenceError;

fn lock<'a, T>(mutex: &'a Mutex<T>, target: &str) -> Result<MutexGuard<'a, T>, PersistenceError> {
    mutex
        .lock()
        .map_err(|_| PersistenceError::Unavailable(format!("{target} lock poisoned")))
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<Collection, BTreeMap<String, Value>>>,
}

impl DocumentStore for MemoryDocumentStore {
    fn put(
        &self,
        collection: Collection,
        id: &str,
        document: &Value,
    ) -> Result<(), PersistenceError> {
        let mut guard = lock(&self.collections, "document store")?;
        guard
            .entry(collection)
            .or_default()
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, PersistenceError> {
        let guard = lock(&self.collections, "document store")?;
        Ok(guard.get(&collection).and_then(|docs| docs.get(id)).cloned())
    }

    fn list(&self, collection: Collection) -> Result<Vec<Value>, PersistenceError> {
        let guard = lock(&self.collections, "document store")?;
        Ok(guard
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl BlobStore for MemoryBlobStore {
    fn write(&self, locator: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        lock(&self.blobs, "blob store")?.insert(locator.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, locator: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(lock(&self.blobs, "blob store")?.get(locator).cloned())
    }

    fn exists(&self, locator: &str) -> Result<bool, PersistenceError> {
        Ok(lock(&self.blobs, "blob store")?.contains_key(locator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_is_ordered_by_id() {
        let store = MemoryDocumentStore::default();
        store.put(Collection::Runs, "b", &json!({"id": "b"})).unwrap();
        store.put(Collection::Runs, "a", &json!({"id": "a"})).unwrap();
        store.put(Collection::Experiments, "c", &json!({"id": "c"})).unwrap();

        let runs = store.list(Collection::Runs).unwrap();
        assert_eq!(runs, vec![json!({"id": "a"}), json!({"id": "b"})]);
        assert!(store.get(Collection::Runs, "c").unwrap().is_none());
    }
}

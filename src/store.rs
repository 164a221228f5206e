//! Narrow persistence interface: a document store for records and a blob
//! area for payloads. The engine only ever talks to these traits through an
//! explicit [`StoreHandle`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::PersistenceError;
use crate::retry::RetryPolicy;

pub mod fs;
pub mod memory;

pub use fs::{FsBlobStore, FsDocumentStore};
pub use memory::{MemoryBlobStore, MemoryDocumentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Experiments,
    PipelineDefinitions,
    Runs,
    RunStages,
    Artifacts,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Experiments => "experiments",
            Collection::PipelineDefinitions => "pipelineDefinitions",
            Collection::Runs => "runs",
            Collection::RunStages => "runStages",
            Collection::Artifacts => "artifacts",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait DocumentStore: Send + Sync {
    /// Insert or replace the document stored under `id`.
    fn put(&self, collection: Collection, id: &str, document: &Value)
    -> Result<(), PersistenceError>;
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, PersistenceError>;
    /// All documents of a collection, ordered by id.
    fn list(&self, collection: Collection) -> Result<Vec<Value>, PersistenceError>;
}

pub trait BlobStore: Send + Sync {
    fn write(&self, locator: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
    fn read(&self, locator: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn exists(&self, locator: &str) -> Result<bool, PersistenceError> {
        Ok(self.read(locator)?.is_some())
    }
}

/// Process-wide store handle. Constructed once and passed by reference to
/// every component that persists anything.
#[derive(Clone)]
pub struct StoreHandle {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StoreHandle {
    pub fn new(documents: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            documents,
            blobs,
            retry: RetryPolicy::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
        )
    }

    pub fn open(root: &Path) -> Result<Self, PersistenceError> {
        Ok(Self::new(
            Arc::new(FsDocumentStore::open(root.join("documents"))?),
            Arc::new(FsBlobStore::open(root.join("blobs"))?),
        ))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn retrying<T>(
        &self,
        label: &str,
        op: impl FnMut(u32) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        self.retry.run(label, PersistenceError::is_transient, op)
    }

    pub fn put_doc<T: Serialize>(
        &self,
        collection: Collection,
        id: &str,
        document: &T,
    ) -> Result<(), PersistenceError> {
        let value = serde_json::to_value(document)
            .map_err(|err| PersistenceError::serialization(format!("{collection}/{id}"), err))?;
        self.retrying("document.put", |_| self.documents.put(collection, id, &value))
    }

    pub fn get_doc<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>, PersistenceError> {
        let Some(value) = self.retrying("document.get", |_| self.documents.get(collection, id))?
        else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| PersistenceError::serialization(format!("{collection}/{id}"), err))
    }

    pub fn list_docs<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Result<Vec<T>, PersistenceError> {
        let values = self.retrying("document.list", |_| self.documents.list(collection))?;
        values
            .into_iter()
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|err| PersistenceError::serialization(collection.as_str(), err))
            })
            .collect()
    }

    pub fn write_blob(&self, locator: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.retrying("blob.write", |_| self.blobs.write(locator, bytes))
    }

    pub fn read_blob(&self, locator: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.retrying("blob.read", |_| self.blobs.read(locator))
    }

    pub fn blob_exists(&self, locator: &str) -> Result<bool, PersistenceError> {
        self.retrying("blob.exists", |_| self.blobs.exists(locator))
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::{debug, error, warn};

use crate::artifact::{Artifact, ArtifactKey, ArtifactRecord, Payload};
use crate::error::{DataIntegrityError, EngineError, EngineResult, PersistenceError};
use crate::hashing::hash_bytes;
use crate::store::{Collection, StoreHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Same key, byte-identical content: nothing written.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeOutcome {
    /// Found in the store.
    Cached,
    /// This caller ran the computation.
    Computed,
    /// Another caller was already computing the key; this one waited for it.
    Joined,
}

#[derive(Default)]
struct InFlight {
    result: Mutex<Option<EngineResult<Artifact>>>,
    ready: Condvar,
}

impl InFlight {
    fn complete(&self, result: EngineResult<Artifact>) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> EngineResult<Artifact> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Releases waiters even when the leader unwinds or returns early.
struct LeaderGuard<'a> {
    inflight: &'a Mutex<HashMap<ArtifactKey, Arc<InFlight>>>,
    key: &'a ArtifactKey,
    slot: Arc<InFlight>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.slot
            .complete(Err(EngineError::Abandoned(self.key.clone())));
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}

/// Content-addressed, immutable artifact storage with process-wide
/// single-flight computation per key.
pub struct ArtifactStore {
    store: StoreHandle,
    inflight: Mutex<HashMap<ArtifactKey, Arc<InFlight>>>,
}

impl ArtifactStore {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self) -> &StoreHandle {
        &self.store
    }

    pub fn record(&self, key: &ArtifactKey) -> EngineResult<Option<ArtifactRecord>> {
        Ok(self.store.get_doc(Collection::Artifacts, key.as_str())?)
    }

    /// `None` when no complete artifact exists for `key`.
    pub fn try_get(&self, key: &ArtifactKey) -> EngineResult<Option<Artifact>> {
        let Some(record) = self.record(key)? else {
            return Ok(None);
        };
        let Some(bytes) = self.store.read_blob(&record.storage_locator)? else {
            warn!(key = %key, locator = %record.storage_locator, "Artifact record has no blob");
            return Ok(None);
        };

        let actual = hash_bytes(&bytes);
        if actual != record.metadata.content_hash {
            error!(key = %key, stored = %record.metadata.content_hash, actual = %actual, "Stored blob does not match its record");
            return Err(DataIntegrityError {
                key: key.clone(),
                stored: record.metadata.content_hash,
                incoming: actual,
            }
            .into());
        }

        let payload: Payload = serde_json::from_slice(&bytes)
            .map_err(|err| PersistenceError::serialization(&record.storage_locator, err))?;
        Ok(Some(Artifact {
            key: record.key,
            payload,
            metadata: record.metadata,
        }))
    }

    pub fn get(&self, key: &ArtifactKey) -> EngineResult<Artifact> {
        self.try_get(key)?
            .ok_or_else(|| EngineError::not_found("artifact", key.as_str()))
    }

    pub fn contains(&self, key: &ArtifactKey) -> EngineResult<bool> {
        let Some(record) = self.record(key)? else {
            return Ok(false);
        };
        Ok(self.store.blob_exists(&record.storage_locator)?)
    }

    /// Idempotent write. Identical content under an existing key is a no-op;
    /// different content is a [`DataIntegrityError`] and nothing is
    /// overwritten.
    pub fn put(&self, artifact: &Artifact) -> EngineResult<PutOutcome> {
        let key = &artifact.key;
        let bytes = artifact.payload.canonical_bytes()?;
        let incoming = hash_bytes(&bytes);

        if let Some(existing) = self.record(key)? {
            if existing.metadata.content_hash != incoming {
                error!(
                    key = %key,
                    stage = %artifact.metadata.stage,
                    version = artifact.metadata.version,
                    stored = %existing.metadata.content_hash,
                    incoming = %incoming,
                    "DATA INTEGRITY VIOLATION: same key produced different content; stage is nondeterministic or mis-versioned"
                );
                return Err(DataIntegrityError {
                    key: key.clone(),
                    stored: existing.metadata.content_hash,
                    incoming,
                }
                .into());
            }
            if !self.store.blob_exists(&existing.storage_locator)? {
                self.store.write_blob(&existing.storage_locator, &bytes)?;
            }
            debug!(key = %key, "Artifact already present");
            return Ok(PutOutcome::AlreadyPresent);
        }

        let mut metadata = artifact.metadata.clone();
        metadata.content_hash = incoming;
        metadata.size_bytes = bytes.len() as u64;
        let record = ArtifactRecord {
            key: key.clone(),
            artifact_type: artifact.payload.artifact_type(),
            metadata,
            storage_locator: key.locator(),
        };

        // Blob first: a record must never point at a missing blob.
        self.store.write_blob(&record.storage_locator, &bytes)?;
        self.store
            .put_doc(Collection::Artifacts, key.as_str(), &record)?;
        debug!(key = %key, size_bytes = bytes.len(), "Artifact stored");
        Ok(PutOutcome::Stored)
    }

    /// Return the artifact for `key`, computing and storing it if absent. At
    /// most one computation per key runs at a time in this process; other
    /// callers block until it finishes and share its result.
    pub fn get_or_compute<F>(
        &self,
        key: &ArtifactKey,
        compute: F,
    ) -> EngineResult<(Artifact, ComputeOutcome)>
    where
        F: FnOnce() -> EngineResult<Artifact>,
    {
        if let Some(artifact) = self.try_get(key)? {
            return Ok((artifact, ComputeOutcome::Cached));
        }

        let (slot, leader) = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.get(key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(InFlight::default());
                    inflight.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            debug!(key = %key, "Joining in-flight computation");
            return slot.wait().map(|artifact| (artifact, ComputeOutcome::Joined));
        }

        let guard = LeaderGuard {
            inflight: &self.inflight,
            key,
            slot,
        };

        // A previous leader may have committed between the first lookup and
        // this registration.
        let result = match self.try_get(key) {
            Ok(Some(artifact)) => Ok((artifact, ComputeOutcome::Cached)),
            Ok(None) => compute().and_then(|artifact| {
                self.put(&artifact)?;
                Ok((artifact, ComputeOutcome::Computed))
            }),
            Err(err) => Err(err),
        };

        guard
            .slot
            .complete(result.clone().map(|(artifact, _)| artifact));
        drop(guard);
        result
    }
}

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use super::{BlobStore, Collection, DocumentStore};
use crate::error::PersistenceError;

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let target = path.display().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| PersistenceError::io("create", &target, err))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).map_err(|err| PersistenceError::io("write", &target, err))?;
    fs::rename(&tmp, path).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        PersistenceError::io("rename", &target, err)
    })
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PersistenceError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PersistenceError::io("read", path.display().to_string(), err)),
    }
}

fn check_segment(id: &str) -> Result<(), PersistenceError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::Serialization {
            target: id.to_string(),
            message: "document ids may only contain ASCII letters, digits, '-', '_' and '.'"
                .to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| PersistenceError::io("create", root.display().to_string(), err))?;
        Ok(Self { root })
    }

    fn path(&self, collection: Collection, id: &str) -> Result<PathBuf, PersistenceError> {
        check_segment(id)?;
        Ok(self.root.join(collection.as_str()).join(format!("{id}.json")))
    }
}

impl DocumentStore for FsDocumentStore {
    fn put(
        &self,
        collection: Collection,
        id: &str,
        document: &Value,
    ) -> Result<(), PersistenceError> {
        let path = self.path(collection, id)?;
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|err| PersistenceError::serialization(path.display().to_string(), err))?;
        write_atomic(&path, &bytes)
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, PersistenceError> {
        let path = self.path(collection, id)?;
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| PersistenceError::serialization(path.display().to_string(), err))
    }

    fn list(&self, collection: Collection) -> Result<Vec<Value>, PersistenceError> {
        let dir = self.root.join(collection.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PersistenceError::io("list", dir.display().to_string(), err)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PersistenceError::io("list", dir.display().to_string(), err))?;
            let path = entry.path();
            let is_doc = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_doc {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(bytes) = read_optional(&path)? {
                let value = serde_json::from_slice(&bytes).map_err(|err| {
                    PersistenceError::serialization(path.display().to_string(), err)
                })?;
                documents.push(value);
            }
        }
        Ok(documents)
    }
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| PersistenceError::io("create", root.display().to_string(), err))?;
        Ok(Self { root })
    }

    fn path(&self, locator: &str) -> Result<PathBuf, PersistenceError> {
        let mut path = self.root.clone();
        for segment in locator.split('/') {
            check_segment(segment)?;
            path.push(segment);
        }
        Ok(path)
    }
}

impl BlobStore for FsBlobStore {
    fn write(&self, locator: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        write_atomic(&self.path(locator)?, bytes)
    }

    fn read(&self, locator: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        read_optional(&self.path(locator)?)
    }

    fn exists(&self, locator: &str) -> Result<bool, PersistenceError> {
        Ok(self.path(locator)?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn documents_survive_reopen() {
        let temp = tempdir().unwrap();
        let store = FsDocumentStore::open(temp.path()).unwrap();
        store
            .put(Collection::Experiments, "exp-1", &json!({"name": "tcell"}))
            .unwrap();

        let reopened = FsDocumentStore::open(temp.path()).unwrap();
        assert_eq!(
            reopened.get(Collection::Experiments, "exp-1").unwrap(),
            Some(json!({"name": "tcell"}))
        );
        assert_eq!(reopened.list(Collection::Experiments).unwrap().len(), 1);
        assert!(reopened.list(Collection::Runs).unwrap().is_empty());
    }

    #[test]
    fn blob_locators_map_to_nested_paths() {
        let temp = tempdir().unwrap();
        let blobs = FsBlobStore::open(temp.path()).unwrap();
        blobs.write("artifacts/ab/cd/abcd01", b"payload").unwrap();

        assert!(temp.path().join("artifacts/ab/cd/abcd01").is_file());
        assert_eq!(
            blobs.read("artifacts/ab/cd/abcd01").unwrap(),
            Some(b"payload".to_vec())
        );
        assert_eq!(blobs.read("artifacts/ab/cd/missing").unwrap(), None);
        assert!(blobs.write("../escape", b"x").is_err());
    }
}

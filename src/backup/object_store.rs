// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Minimal object storage interface for commit log segments.
//!
//! Objects are immutable blobs with string metadata, addressed by bucket and
//! name. Listings may lag writes; `stat` and `read` never do.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const METADATA_SUFFIX: &str = ".metadata.json";

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object {bucket}/{name} not found")]
    NotFound { bucket: String, name: String },
    #[error("invalid object name {0:?}")]
    InvalidName(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt object metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Names in `bucket` starting with `prefix`. May omit recent writes.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Metadata of one object, `None` if it does not exist.
    async fn stat(&self, bucket: &str, name: &str) -> Result<Option<ObjectInfo>, ObjectStoreError>;

    async fn read(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectStoreError>;

    async fn write(
        &self,
        bucket: &str,
        name: &str,
        body: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectInfo, ObjectStoreError>;
}

struct StoredObject {
    body: Vec<u8>,
    info: ObjectInfo,
}

type ObjectId = (String, String);

/// In-process store for tests and local runs.
///
/// Objects can be hidden from listings to reproduce eventually consistent
/// listing, and individual `stat` calls can be made to fail.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<ObjectId, StoredObject>,
    hidden: DashSet<ObjectId>,
    failing: DashSet<ObjectId>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaves the object readable but absent from `list`.
    pub fn hide_from_listing(&self, bucket: &str, name: &str) {
        self.hidden.insert((bucket.to_string(), name.to_string()));
    }

    /// Makes `stat` of this object fail until cleared.
    pub fn fail_stat(&self, bucket: &str, name: &str) {
        self.failing.insert((bucket.to_string(), name.to_string()));
    }

    pub fn remove(&self, bucket: &str, name: &str) -> bool {
        self.objects.remove(&(bucket.to_string(), name.to_string())).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| {
                let (b, name) = entry.key();
                b == bucket && name.starts_with(prefix) && !self.hidden.contains(entry.key())
            })
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn stat(&self, bucket: &str, name: &str) -> Result<Option<ObjectInfo>, ObjectStoreError> {
        let id = (bucket.to_string(), name.to_string());
        if self.failing.contains(&id) {
            return Err(ObjectStoreError::Unavailable(format!("stat {bucket}/{name}")));
        }
        Ok(self.objects.get(&id).map(|object| object.info.clone()))
    }

    async fn read(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|object| object.body.clone())
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            })
    }

    async fn write(
        &self,
        bucket: &str,
        name: &str,
        body: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectInfo, ObjectStoreError> {
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            name: name.to_string(),
            size: body.len() as u64,
            metadata,
        };
        self.objects.insert(
            (bucket.to_string(), name.to_string()),
            StoredObject { body, info: info.clone() },
        );
        Ok(info)
    }
}

/// Directory-backed store: one directory per bucket, each object next to a
/// JSON sidecar holding its [`ObjectInfo`].
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf, ObjectStoreError> {
        for part in [bucket, name] {
            if part.is_empty() || part.contains('/') || part.contains('\\') || part.starts_with('.') {
                return Err(ObjectStoreError::InvalidName(part.to_string()));
            }
        }
        if name.ends_with(METADATA_SUFFIX) {
            return Err(ObjectStoreError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(bucket).join(name))
    }

    fn metadata_path(object: &Path) -> PathBuf {
        let mut path = object.as_os_str().to_owned();
        path.push(METADATA_SUFFIX);
        PathBuf::from(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let dir = self.root.join(bucket);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(prefix) && !name.ends_with(METADATA_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn stat(&self, bucket: &str, name: &str) -> Result<Option<ObjectInfo>, ObjectStoreError> {
        let path = Self::metadata_path(&self.object_path(bucket, name)?);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.object_path(bucket, name)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            },
            _ => e.into(),
        })
    }

    async fn write(
        &self,
        bucket: &str,
        name: &str,
        body: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectInfo, ObjectStoreError> {
        let path = self.object_path(bucket, name)?;
        tokio::fs::create_dir_all(self.root.join(bucket)).await?;
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            name: name.to_string(),
            size: body.len() as u64,
            metadata,
        };
        tokio::fs::write(&path, &body).await?;
        // Sidecar last: an object without one is invisible to stat.
        tokio::fs::write(Self::metadata_path(&path), serde_json::to_vec_pretty(&info)?).await?;
        debug!(bucket, name, size = info.size, "Wrote object");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metadata(lower: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("lowerBoundCheckpoint".to_string(), lower.to_string())])
    }

    #[tokio::test]
    async fn test_memory_hidden_objects_still_stat() {
        let store = MemoryObjectStore::new();
        store.write("logs", "seg_2", b"b".to_vec(), metadata("1")).await.unwrap();
        store.write("logs", "seg_1", b"a".to_vec(), metadata("0")).await.unwrap();
        store.write("other", "seg_3", vec![], BTreeMap::new()).await.unwrap();
        store.hide_from_listing("logs", "seg_2");

        assert_eq!(store.list("logs", "seg_").await.unwrap(), vec!["seg_1"]);
        let info = store.stat("logs", "seg_2").await.unwrap().unwrap();
        assert_eq!(info.metadata["lowerBoundCheckpoint"], "1");
        assert_eq!(store.read("logs", "seg_2").await.unwrap(), b"b");
        assert!(store.stat("logs", "seg_9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_stat_failure_injection() {
        let store = MemoryObjectStore::new();
        store.write("logs", "seg_1", vec![], BTreeMap::new()).await.unwrap();
        store.fail_stat("logs", "seg_1");
        assert!(matches!(
            store.stat("logs", "seg_1").await,
            Err(ObjectStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.list("logs", "").await.unwrap().is_empty());

        let name = "commit_diff_until_2021-01-01T00:00:00.000Z";
        store.write("logs", name, b"body".to_vec(), metadata("x")).await.unwrap();
        store.write("logs", "unrelated", vec![], BTreeMap::new()).await.unwrap();

        assert_eq!(store.list("logs", "commit_diff_until_").await.unwrap(), vec![name]);
        assert_eq!(store.read("logs", name).await.unwrap(), b"body");
        let info = store.stat("logs", name).await.unwrap().unwrap();
        assert_eq!(info.size, 4);
        assert_eq!(info.metadata, metadata("x"));

        // a second handle sees the same objects
        let reopened = FsObjectStore::new(dir.path());
        assert!(reopened.stat("logs", name).await.unwrap().is_some());
        assert!(matches!(
            reopened.read("logs", "missing").await,
            Err(ObjectStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fs_rejects_path_escapes() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        for name in ["../x", "a/b", ".hidden", "x.metadata.json"] {
            assert!(matches!(
                store.write("logs", name, vec![], BTreeMap::new()).await,
                Err(ObjectStoreError::InvalidName(_))
            ));
        }
    }
}

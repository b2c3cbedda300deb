//! Local filesystem object store driver, the reference backend used by
//! the integration tests. Objects are sharded one directory level deep by
//! the first two characters of their name, matching
//! `storage_interface/filesystem.py`'s `get_filesystem_storage_path`.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::{chunk_channel, ChunkReceiver, Container, Object, ObjectMetadata, ObjectStore};
use crate::error::{StorageError, StorageResult};

/// Resolve the on-disk path for `object_name` under `root`, sharding one
/// directory level deep by the name's first two characters.
fn shard_path(root: &Path, object_name: &str) -> PathBuf {
    if object_name.len() < 2 {
        root.join(object_name)
    } else {
        root.join(&object_name[..2]).join(object_name)
    }
}

pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn get_container(&self, name: &str) -> StorageResult<Box<dyn Container>> {
        let path = self.root.join(name);
        if !path.is_dir() {
            return Err(StorageError::Filesystem(format!(
                "container '{}' does not exist under {}",
                name,
                self.root.display()
            )));
        }
        Ok(Box::new(FilesystemContainer::new(path)))
    }

    async fn create_container(&self, name: &str) -> StorageResult<Box<dyn Container>> {
        if let Some(prefix) = name.strip_suffix('*') {
            for _ in 0..super::CONTAINER_AUTO_CREATE_ATTEMPTS {
                let candidate = self.root.join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
                if !candidate.exists() {
                    std::fs::create_dir_all(&candidate)
                        .map_err(|e| StorageError::Filesystem(e.to_string()))?;
                    return Ok(Box::new(FilesystemContainer::new(candidate)));
                }
            }
            return Err(StorageError::ContainerAlreadyExists(format!(
                "could not find unused directory name after {} attempts for prefix '{}'",
                super::CONTAINER_AUTO_CREATE_ATTEMPTS,
                prefix
            )));
        }

        let path = self.root.join(name);
        if path.exists() {
            return Err(StorageError::ContainerAlreadyExists(name.to_string()));
        }
        std::fs::create_dir_all(&path).map_err(|e| StorageError::Filesystem(e.to_string()))?;
        Ok(Box::new(FilesystemContainer::new(path)))
    }
}

struct FilesystemContainer {
    root: PathBuf,
    upload_chunk_size: usize,
}

impl FilesystemContainer {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            upload_chunk_size: super::DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }
}

struct FilesystemObject {
    name: String,
    metadata: ObjectMetadata,
}

#[async_trait]
impl Object for FilesystemObject {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> StorageResult<ObjectMetadata> {
        Ok(self.metadata.clone())
    }
}

#[async_trait]
impl Container for FilesystemContainer {
    fn name(&self) -> &str {
        self.root.to_str().unwrap_or_default()
    }

    async fn get_object(&self, name: &str) -> StorageResult<Box<dyn Object>> {
        let path = shard_path(&self.root, name);
        let meta = std::fs::metadata(&path)
            .map_err(|_| StorageError::ObjectDoesNotExist(name.to_string()))?;
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| chrono::DateTime::<chrono::Utc>::from_timestamp(d.as_secs() as i64, 0))
            .flatten()
            .unwrap_or_else(chrono::Utc::now);

        Ok(Box::new(FilesystemObject {
            name: name.to_string(),
            metadata: ObjectMetadata {
                name: name.to_string(),
                size: meta.len(),
                last_modified,
                etag: None,
                custom_metadata: HashMap::new(),
            },
        }))
    }

    async fn delete_object(&self, name: &str) -> StorageResult<()> {
        let path = shard_path(&self.root, name);
        std::fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ObjectDoesNotExist(name.to_string())
            } else {
                StorageError::Filesystem(e.to_string())
            }
        })
    }

    fn upload_chunk_size(&self) -> usize {
        self.upload_chunk_size
    }

    async fn list_objects(&self, prefix: &str) -> StorageResult<Vec<ObjectMetadata>> {
        let mut out = Vec::new();
        let walker = walk_files(&self.root).map_err(|e| StorageError::Filesystem(e.to_string()))?;
        for path in walker {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !prefix.is_empty() && !file_name.starts_with(prefix) {
                continue;
            }
            let meta = std::fs::metadata(&path).map_err(|e| StorageError::Filesystem(e.to_string()))?;
            let last_modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| chrono::DateTime::<chrono::Utc>::from_timestamp(d.as_secs() as i64, 0))
                .flatten()
                .unwrap_or_else(chrono::Utc::now);
            out.push(ObjectMetadata {
                name: file_name.to_string(),
                size: meta.len(),
                last_modified,
                etag: None,
                custom_metadata: HashMap::new(),
            });
        }
        Ok(out)
    }

    /// Drains `chunks` and writes them to disk as they arrive. A chunk
    /// shorter than `upload_chunk_size()` is only legal as the final one
    /// (spec 4.3, spec 5's writer invariant); since the sender tells us
    /// "no more chunks" only by closing, a short chunk is held back one
    /// step so it can be checked once its successor (or channel close)
    /// is known.
    async fn upload_stream_to_object(
        &self,
        name: &str,
        mut chunks: ChunkReceiver,
    ) -> StorageResult<ObjectMetadata> {
        let path = shard_path(&self.root, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Filesystem(e.to_string()))?;
        }
        let mut file = std::fs::File::create(&path).map_err(|e| StorageError::Filesystem(e.to_string()))?;
        let chunk_size = self.upload_chunk_size();

        let mut total = 0u64;
        let mut pending: Option<Bytes> = None;
        while let Some(chunk) = chunks.recv().await {
            if let Some(prev) = pending.take() {
                if prev.len() != chunk_size {
                    return Err(StorageError::UploadFailed(format!(
                        "non-final chunk of {} bytes does not match upload_chunk_size {}",
                        prev.len(),
                        chunk_size
                    )));
                }
                file.write_all(&prev).map_err(|e| StorageError::Filesystem(e.to_string()))?;
                total += prev.len() as u64;
            }
            pending = Some(chunk);
        }
        if let Some(last) = pending {
            file.write_all(&last).map_err(|e| StorageError::Filesystem(e.to_string()))?;
            total += last.len() as u64;
        }
        file.sync_all().map_err(|e| StorageError::Filesystem(e.to_string()))?;

        Ok(ObjectMetadata {
            name: name.to_string(),
            size: total,
            last_modified: chrono::Utc::now(),
            etag: None,
            custom_metadata: HashMap::new(),
        })
    }

    /// Reads the file in `chunk_size`-sized pieces on a blocking thread,
    /// forwarding each into the bounded channel as it is read rather than
    /// reading the whole object into memory first.
    async fn download_object_as_stream(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> StorageResult<ChunkReceiver> {
        let path = shard_path(&self.root, name);
        let mut file = std::fs::File::open(&path)
            .map_err(|_| StorageError::ObjectDoesNotExist(name.to_string()))?;

        let (tx, rx) = chunk_channel();
        let chunk_size = chunk_size.max(1);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = match file.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "filesystem read failed mid-download");
                        break;
                    }
                };
                if n == 0 {
                    break;
                }
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path)?);
        } else {
            out.push(path);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a [`ChunkReceiver`] that yields `parts` in order, one at a
    /// time, then closes — a forward-only source standing in for a real
    /// reader task in tests.
    fn chunk_source(parts: Vec<&'static [u8]>) -> ChunkReceiver {
        let (tx, rx) = chunk_channel();
        tokio::spawn(async move {
            for part in parts {
                if tx.send(Bytes::from_static(part)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn drain(mut rx: ChunkReceiver) -> Vec<u8> {
        let mut all = Vec::new();
        while let Some(chunk) = rx.recv().await {
            all.extend_from_slice(&chunk);
        }
        all
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        let container = store.create_container("c1").await.unwrap();

        container
            .upload_stream_to_object("ab1234", chunk_source(vec![b"hello world"]))
            .await
            .unwrap();

        let downloaded = container.download_object_as_stream("ab1234", 4).await.unwrap();
        assert_eq!(drain(downloaded).await, b"hello world");
    }

    #[tokio::test]
    async fn get_object_missing_is_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        let container = store.create_container("c1").await.unwrap();
        let err = container.get_object("nope12").await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectDoesNotExist(_)));
    }

    #[tokio::test]
    async fn auto_create_container_appends_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        let container = store.create_container("prefix-*").await.unwrap();
        assert!(container.name().starts_with(dir.path().join("prefix-").to_str().unwrap()));
    }

    #[tokio::test]
    async fn list_objects_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        let container = store.create_container("c1").await.unwrap();
        container
            .upload_stream_to_object("aabbcc", chunk_source(vec![b"x"]))
            .await
            .unwrap();
        container
            .upload_stream_to_object("zzyyxx", chunk_source(vec![b"y"]))
            .await
            .unwrap();

        let found = container.list_objects("aa").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "aabbcc");
    }

    #[tokio::test]
    async fn upload_rejects_short_non_final_chunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("c1")).unwrap();
        let container = FilesystemContainer {
            root: dir.path().join("c1"),
            upload_chunk_size: 4,
        };

        let err = container
            .upload_stream_to_object("ab1234", chunk_source(vec![b"ab", b"cd"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UploadFailed(_)));
    }

    #[tokio::test]
    async fn upload_accepts_full_chunks_with_short_final_chunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("c1")).unwrap();
        let container = FilesystemContainer {
            root: dir.path().join("c1"),
            upload_chunk_size: 4,
        };

        container
            .upload_stream_to_object("ab1234", chunk_source(vec![b"abcd", b"ef"]))
            .await
            .unwrap();

        let downloaded = container.download_object_as_stream("ab1234", 16).await.unwrap();
        assert_eq!(drain(downloaded).await, b"abcdef");
    }
}

//! Object store capability (spec 4.3): a container/object abstraction over
//! streaming chunked upload/download, generalized from the teacher's
//! whole-`Bytes` `StorageBackend` trait (`storage/mod.rs` in
//! `meridian-backup`) into forward-only byte-chunk streams so large
//! objects never need to sit fully in memory, either on the wire or in
//! the caller.

pub mod azure;
pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::StorageResult;

/// Default upload chunk size (5 MiB), matching common multipart-upload
/// minimums across cloud providers.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;
/// Default download chunk size (50 MiB).
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 50 * 1024 * 1024;
/// Attempts made when a container name ends in `*` and must be
/// auto-suffixed with a fresh UUID to find an unused name.
pub const CONTAINER_AUTO_CREATE_ATTEMPTS: u32 = 100;
/// Capacity of the bounded chunk queue sitting between a stream's reader
/// and writer halves (spec 5 "Per-upload internal concurrency").
pub const CHUNK_QUEUE_CAPACITY: usize = 5;

/// Metadata describing a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub name: String,
    pub size: u64,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    pub etag: Option<String>,
    pub custom_metadata: HashMap<String, String>,
}

/// Driver selection and connection parameters for a storage definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    Filesystem {
        root: String,
    },
    S3 {
        region: String,
        bucket: String,
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
    },
    Azure {
        account_name: String,
        container: String,
        access_key: Option<String>,
        connection_string: Option<String>,
    },
}

/// The receiving half of a forward-only byte-chunk stream: the consumer
/// side of an upload (driven by a driver's writer) or the producer side of
/// a download (driven by this module's reader tasks). Closing the sender
/// signals EOF; chunks are all `upload_chunk_size()` except a possibly
/// shorter final one (spec 4.3).
pub type ChunkReceiver = mpsc::Receiver<Bytes>;
/// The sending half of a [`ChunkReceiver`], bounded to
/// [`CHUNK_QUEUE_CAPACITY`] so a slow writer applies backpressure to its
/// reader rather than letting the whole object buffer in memory.
pub type ChunkSender = mpsc::Sender<Bytes>;

/// Create a bounded chunk channel sized per spec 5's chunk queue.
pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    mpsc::channel(CHUNK_QUEUE_CAPACITY)
}

/// Spawn a task that re-chunks an arbitrarily-granular backend-native byte
/// stream (`source`, e.g. one item per network page or HTTP body poll)
/// into `chunk_size`-sized pieces and forwards them into a bounded
/// [`ChunkReceiver`], so callers see the "chunks of up to `chunk_size`
/// bytes" contract (spec 4.3) regardless of how the backend SDK actually
/// hands data back. A source error or a closed receiver ends the task
/// early; this is best-effort since a closed receiver means the reader
/// has already stopped caring.
pub fn spawn_rechunked_download<S>(mut source: S, chunk_size: usize) -> ChunkReceiver
where
    S: Stream<Item = StorageResult<Bytes>> + Unpin + Send + 'static,
{
    use futures::StreamExt;

    let (tx, rx) = chunk_channel();
    let chunk_size = chunk_size.max(1);
    tokio::spawn(async move {
        let mut pending = BytesMut::new();
        while let Some(next) = source.next().await {
            let bytes = match next {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "backend stream ended early during download");
                    break;
                }
            };
            pending.extend_from_slice(&bytes);
            while pending.len() >= chunk_size {
                let chunk = pending.split_to(chunk_size).freeze();
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(pending.freeze()).await;
        }
    });
    rx
}

/// A single object within a container.
#[async_trait]
pub trait Object: Send + Sync {
    fn name(&self) -> &str;
    async fn metadata(&self) -> StorageResult<ObjectMetadata>;
}

/// A named bucket of objects within a backend.
#[async_trait]
pub trait Container: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch a handle to an existing object, or `ObjectDoesNotExist`.
    async fn get_object(&self, name: &str) -> StorageResult<Box<dyn Object>>;

    async fn delete_object(&self, name: &str) -> StorageResult<()>;

    /// List objects whose name starts with `prefix`.
    async fn list_objects(&self, prefix: &str) -> StorageResult<Vec<ObjectMetadata>>;

    /// Consume `chunks`, a forward-only stream of byte chunks of exactly
    /// `upload_chunk_size()` except a possibly-shorter final chunk, writing
    /// them to a new object named `name`. The sender side is closed by the
    /// caller's reader task once the source is exhausted; this method never
    /// sees more than [`CHUNK_QUEUE_CAPACITY`] chunks buffered ahead of it.
    async fn upload_stream_to_object(
        &self,
        name: &str,
        chunks: ChunkReceiver,
    ) -> StorageResult<ObjectMetadata>;

    /// Read an existing object back as a forward-only stream of byte
    /// chunks of up to `chunk_size` bytes each, without materializing the
    /// whole object in memory.
    async fn download_object_as_stream(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> StorageResult<ChunkReceiver>;

    fn upload_chunk_size(&self) -> usize {
        DEFAULT_UPLOAD_CHUNK_SIZE
    }

    fn download_chunk_size(&self) -> usize {
        DEFAULT_DOWNLOAD_CHUNK_SIZE
    }
}

/// Top-level capability: get or create containers, and classify errors for
/// retry eligibility.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_container(&self, name: &str) -> StorageResult<Box<dyn Container>>;

    /// Create a container named `name`. If `name` ends in `*`, the literal
    /// asterisk is replaced with a fresh UUID and retried up to
    /// `CONTAINER_AUTO_CREATE_ATTEMPTS` times until an unused name is
    /// found (spec 4.3).
    async fn create_container(&self, name: &str) -> StorageResult<Box<dyn Container>>;

    /// Whether an error returned by this backend is eligible for
    /// exponential-backoff retry (spec 4.3 `retry_exceptions`).
    fn is_retryable(&self, error: &crate::error::StorageError) -> bool {
        error.is_retryable()
    }
}

/// Construct a backend from a storage definition.
pub async fn create_object_store(config: StorageConfig) -> StorageResult<Box<dyn ObjectStore>> {
    match config {
        StorageConfig::Filesystem { root } => {
            Ok(Box::new(filesystem::FilesystemStore::new(root)))
        }
        StorageConfig::S3 { .. } => Ok(Box::new(s3::S3Store::new(config).await?)),
        StorageConfig::Azure { .. } => Ok(Box::new(azure::AzureStore::new(config).await?)),
    }
}

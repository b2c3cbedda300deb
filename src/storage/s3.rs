//! AWS S3 object store driver.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Region,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;

use super::{spawn_rechunked_download, ChunkReceiver, Container, Object, ObjectMetadata, ObjectStore, StorageConfig};
use crate::error::{StorageError, StorageResult};

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: StorageConfig) -> StorageResult<Self> {
        let (region, bucket, endpoint, _access_key, _secret_key) = match config {
            StorageConfig::S3 {
                region,
                bucket,
                endpoint,
                access_key,
                secret_key,
            } => (region, bucket, endpoint, access_key, secret_key),
            _ => {
                return Err(StorageError::AuthenticationFailed(
                    "invalid configuration for S3".to_string(),
                ))
            }
        };

        let mut config_builder = aws_config::from_env().region(Region::new(region));
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }

        let aws_config = config_builder.load().await;
        let client = Client::new(&aws_config);

        Ok(Self { client, bucket })
    }

    fn map_err<E: std::fmt::Display>(err: E) -> StorageError {
        StorageError::S3(err.to_string())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get_container(&self, name: &str) -> StorageResult<Box<dyn Container>> {
        self.client
            .head_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(Box::new(S3Container {
            client: self.client.clone(),
            bucket: name.to_string(),
        }))
    }

    async fn create_container(&self, name: &str) -> StorageResult<Box<dyn Container>> {
        if let Some(prefix) = name.strip_suffix('*') {
            for _ in 0..super::CONTAINER_AUTO_CREATE_ATTEMPTS {
                let candidate = format!("{}{}", prefix, uuid::Uuid::new_v4());
                if self
                    .client
                    .create_bucket()
                    .bucket(&candidate)
                    .send()
                    .await
                    .is_ok()
                {
                    return Ok(Box::new(S3Container {
                        client: self.client.clone(),
                        bucket: candidate,
                    }));
                }
            }
            return Err(StorageError::ContainerAlreadyExists(format!(
                "could not find unused bucket name after {} attempts for prefix '{}'",
                super::CONTAINER_AUTO_CREATE_ATTEMPTS,
                prefix
            )));
        }

        self.client
            .create_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(Box::new(S3Container {
            client: self.client.clone(),
            bucket: name.to_string(),
        }))
    }
}

struct S3Container {
    client: Client,
    bucket: String,
}

impl S3Container {
    fn map_err<E: std::fmt::Display>(err: E) -> StorageError {
        StorageError::S3(err.to_string())
    }
}

struct S3Object {
    name: String,
    metadata: ObjectMetadata,
}

#[async_trait]
impl Object for S3Object {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> StorageResult<ObjectMetadata> {
        Ok(self.metadata.clone())
    }
}

#[async_trait]
impl Container for S3Container {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn get_object(&self, name: &str) -> StorageResult<Box<dyn Object>> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|_| StorageError::ObjectDoesNotExist(name.to_string()))?;

        Ok(Box::new(S3Object {
            name: name.to_string(),
            metadata: ObjectMetadata {
                name: name.to_string(),
                size: output.content_length().unwrap_or(0) as u64,
                last_modified: output
                    .last_modified()
                    .and_then(|dt| {
                        chrono::DateTime::parse_from_rfc3339(&dt.to_string())
                            .ok()
                            .map(|dt| dt.with_timezone(&chrono::Utc))
                    })
                    .unwrap_or_else(chrono::Utc::now),
                etag: output.e_tag().map(|s| s.to_string()),
                custom_metadata: output
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            },
        }))
    }

    async fn delete_object(&self, name: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> StorageResult<Vec<ObjectMetadata>> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(Self::map_err)?;

        Ok(output
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectMetadata {
                    name: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|dt| {
                            chrono::DateTime::parse_from_rfc3339(&dt.to_string())
                                .ok()
                                .map(|dt| dt.with_timezone(&chrono::Utc))
                        })
                        .unwrap_or_else(chrono::Utc::now),
                    etag: obj.e_tag().map(|s| s.to_string()),
                    custom_metadata: HashMap::new(),
                })
            })
            .collect())
    }

    /// Drains `chunks` as they arrive and maps each directly onto an S3
    /// multipart-upload part (or a single PUT if the stream turns out to
    /// hold only one chunk), so the bucket never needs the whole object
    /// buffered here at once — the one chunk held in memory at a time is
    /// bounded by `upload_chunk_size()`.
    async fn upload_stream_to_object(
        &self,
        name: &str,
        mut chunks: ChunkReceiver,
    ) -> StorageResult<ObjectMetadata> {
        let Some(first) = chunks.recv().await else {
            let output = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(name)
                .body(ByteStream::from(Bytes::new()))
                .send()
                .await
                .map_err(Self::map_err)?;
            return Ok(ObjectMetadata {
                name: name.to_string(),
                size: 0,
                last_modified: chrono::Utc::now(),
                etag: output.e_tag().map(|s| s.to_string()),
                custom_metadata: HashMap::new(),
            });
        };

        let Some(second) = chunks.recv().await else {
            let total = first.len() as u64;
            let output = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(name)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(Self::map_err)?;
            return Ok(ObjectMetadata {
                name: name.to_string(),
                size: total,
                last_modified: chrono::Utc::now(),
                etag: output.e_tag().map(|s| s.to_string()),
                custom_metadata: HashMap::new(),
            });
        };

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(Self::map_err)?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StorageError::UploadFailed("no upload id returned".to_string()))?
            .to_string();

        let mut completed = Vec::new();
        let mut total = 0u64;
        let mut part_number = 1i32;
        let mut next = Some(first);
        let mut after = Some(second);
        loop {
            let Some(chunk) = next.take().or_else(|| after.take()) else {
                break;
            };
            if chunk.is_empty() {
                break;
            }
            total += chunk.len() as u64;
            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(name)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(Self::map_err)?;
            let etag = part
                .e_tag()
                .ok_or_else(|| StorageError::UploadFailed("no etag returned".to_string()))?
                .to_string();
            completed.push(CompletedPart::builder().part_number(part_number).e_tag(etag).build());
            part_number += 1;

            if next.is_none() && after.is_none() {
                next = chunks.recv().await;
            }
        }

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(Self::map_err)?;

        Ok(ObjectMetadata {
            name: name.to_string(),
            size: total,
            last_modified: chrono::Utc::now(),
            etag: output.e_tag().map(|s| s.to_string()),
            custom_metadata: HashMap::new(),
        })
    }

    /// Forwards the object's native `ByteStream` into a bounded, re-chunked
    /// channel rather than collecting the whole body before returning
    /// (spec 4.3).
    async fn download_object_as_stream(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> StorageResult<ChunkReceiver> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|_| StorageError::ObjectDoesNotExist(name.to_string()))?;

        let source = output.body.map(|res| res.map_err(|e| StorageError::S3(e.to_string())));
        Ok(spawn_rechunked_download(Box::pin(source), chunk_size))
    }
}

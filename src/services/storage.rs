use async_trait::async_trait;
use parking_lot::RwLock;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;

/// Durable blob storage for pipeline artifacts. `put` returns the opaque
/// location reference recorded on the asset row.
#[async_trait]
pub trait AssetStorage: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError>;

    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl AssetStorage for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        if !(200..300).contains(&response.status_code()) {
            return Err(StorageError::Rejected(response.status_code()));
        }
        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(location).await?;
        match response.status_code() {
            200..=299 => {}
            404 => return Err(StorageError::NotFound(location.to_string())),
            status => return Err(StorageError::Rejected(status)),
        }
        Ok(response.to_vec())
    }
}

/// In-process storage for tests and local runs.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl AssetStorage for MemoryStorage {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        self.objects
            .write()
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .get(location)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage request rejected with status {0}")]
    Rejected(u16),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

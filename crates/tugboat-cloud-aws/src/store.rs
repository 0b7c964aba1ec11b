//! `ObjectStore` backed by S3 or an S3-compatible endpoint

use crate::error::S3Error;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::time::Duration;
use tugboat_cloud::{ObjectStore, Result};

/// Bucket settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix for staged contexts
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores; enables path-style addressing
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: "contexts".to_string(),
            endpoint: None,
            region: None,
        }
    }
}

pub struct S3ObjectStore {
    client: Client,
    config: S3Config,
}

impl S3ObjectStore {
    pub fn new(client: Client, config: S3Config) -> Self {
        Self { client, config }
    }

    /// Build a client from the ambient AWS configuration
    pub async fn connect(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        tracing::info!("Using bucket {} for build contexts", config.bucket);
        Self::new(Client::from_conf(builder.build()), config)
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// New unique key under the configured prefix
    pub fn generate_key(&self) -> String {
        object_key(&self.config.prefix, &uuid::Uuid::new_v4().simple().to_string())
    }
}

fn object_key(prefix: &str, id: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}.tar", id)
    } else {
        format!("{}/{}.tar", prefix, id)
    }
}

fn presigning(ttl: Duration) -> std::result::Result<PresigningConfig, S3Error> {
    PresigningConfig::expires_in(ttl).map_err(|e| S3Error::Presign(e.to_string()))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn store(&self, data: Bytes) -> Result<String> {
        let key = self.generate_key();
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .content_type("application/x-tar")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| S3Error::request("put_object", e))?;

        tracing::debug!("Stored {} bytes at s3://{}/{}", size, self.config.bucket, key);
        Ok(key)
    }

    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String> {
        let request = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| S3Error::request("presign get_object", e))?;
        Ok(request.uri().to_string())
    }

    async fn presign_upload(&self, key: &str, ttl: Duration) -> Result<String> {
        let request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| S3Error::request("presign put_object", e))?;
        Ok(request.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| S3Error::request("delete_object", e))?;
        tracing::debug!("Deleted s3://{}/{}", self.config.bucket, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("contexts", "abc"), "contexts/abc.tar");
        assert_eq!(object_key("/contexts/", "abc"), "contexts/abc.tar");
        assert_eq!(object_key("", "abc"), "abc.tar");
    }

    #[test]
    fn test_presigning_rejects_long_expiry() {
        assert!(presigning(Duration::from_secs(30 * 60)).is_ok());
        // S3 caps presigned URLs at 7 days
        assert!(presigning(Duration::from_secs(8 * 24 * 60 * 60)).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = S3Config::new("tugboat-contexts");
        assert_eq!(config.prefix, "contexts");
        assert!(config.endpoint.is_none());
    }
}

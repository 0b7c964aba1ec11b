//! Object store abstraction
//!
//! Build contexts for remote executions are staged here and fetched by the
//! workload through a presigned URL.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under a generated key and return the key
    async fn store(&self, data: Bytes) -> Result<String>;

    /// Presigned download URL for `key`, valid for `ttl`
    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Presigned upload URL for `key`, valid for `ttl`
    async fn presign_upload(&self, key: &str, ttl: Duration) -> Result<String>;

    async fn delete(&self, key: &str) -> Result<()>;
}

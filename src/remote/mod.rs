//! Remote client adapters
//!
//! A thin uniform interface over S3-compatible object stores and FTP
//! servers: list/stat/get/put/delete/rename primitives plus an optional
//! multipart capability the upload engine uses when the protocol has one.

mod ftp;
mod s3;

pub use ftp::{FtpConfig, FtpRemote};
pub use s3::{S3Config, S3Remote};

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Chunked byte stream produced by ranged reads and consumed by puts.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// Identifies an object on a remote: an optional bucket plus a key or path.
///
/// S3 remotes fall back to their configured bucket when `bucket` is `None`;
/// FTP remotes ignore the bucket and treat `key` as a server path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteLocator {
    pub bucket: Option<String>,
    pub key: String,
}

impl RemoteLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            key: key.into(),
        }
    }

    /// Locator without an explicit bucket.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            bucket: None,
            key: key.into(),
        }
    }
}

impl fmt::Display for RemoteLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{}/{}", bucket, self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Metadata for a single remote object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: Option<String>,
    /// Unix seconds, when the remote reports a modification time.
    pub modified_at: Option<i64>,
}

/// One entry from a prefix or directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteEntry {
    pub key: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified_at: Option<i64>,
}

/// Receipt for one acknowledged multipart part.
#[derive(Debug, Clone)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Uniform operations shared by every remote adapter.
///
/// Failures map into the engine error taxonomy; timeout and retry behavior
/// stays inside the underlying SDK clients.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Short protocol tag for logs ("s3", "ftp").
    fn scheme(&self) -> &'static str;

    /// Cheap connectivity and credential check.
    async fn verify(&self) -> Result<(), TransferError>;

    async fn stat(&self, locator: &RemoteLocator) -> Result<ObjectInfo, TransferError>;

    async fn list(&self, locator: &RemoteLocator) -> Result<Vec<RemoteEntry>, TransferError>;

    /// Streaming read starting at byte `start` (0 reads the whole object).
    async fn get_stream(
        &self,
        locator: &RemoteLocator,
        start: u64,
    ) -> Result<ChunkStream, TransferError>;

    /// Streaming write. Returns the number of bytes stored.
    async fn put_stream(
        &self,
        locator: &RemoteLocator,
        source: ChunkStream,
        size_hint: Option<u64>,
        content_type: Option<&str>,
    ) -> Result<u64, TransferError>;

    async fn delete(&self, locator: &RemoteLocator) -> Result<(), TransferError>;

    async fn rename(
        &self,
        from: &RemoteLocator,
        to: &RemoteLocator,
    ) -> Result<(), TransferError>;

    async fn mkdir(&self, locator: &RemoteLocator) -> Result<(), TransferError>;

    /// Multipart capability, when the protocol has one.
    fn multipart(&self) -> Option<&dyn MultipartRemote> {
        None
    }
}

/// Multipart upload session operations for S3-style remotes.
#[async_trait]
pub trait MultipartRemote: Send + Sync {
    /// Opens a session and returns its server-issued identifier.
    async fn create_session(
        &self,
        locator: &RemoteLocator,
        content_type: Option<&str>,
    ) -> Result<String, TransferError>;

    async fn upload_part(
        &self,
        locator: &RemoteLocator,
        session: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, TransferError>;

    /// Commits the object from `parts`, which the caller sorts by part number.
    async fn complete_session(
        &self,
        locator: &RemoteLocator,
        session: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), TransferError>;

    /// Discards the session and every part uploaded into it.
    async fn abort_session(
        &self,
        locator: &RemoteLocator,
        session: &str,
    ) -> Result<(), TransferError>;
}

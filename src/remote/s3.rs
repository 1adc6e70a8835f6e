//! S3-compatible remote adapter (AWS, R2, MinIO, anything path-style).

use std::fmt;

use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::{
    ChunkStream, MultipartRemote, ObjectInfo, RemoteClient, RemoteEntry, RemoteLocator,
    UploadedPart,
};
use crate::error::TransferError;

/// Read buffer granularity for downloaded object bodies.
const GET_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Custom endpoint for R2/MinIO style deployments. `None` targets AWS.
    pub endpoint_url: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Bucket used when a locator carries none.
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub force_path_style: bool,
}

fn default_region() -> String {
    "auto".to_string()
}

/// S3 adapter holding one SDK client for the configured account.
pub struct S3Remote {
    client: Client,
    config: S3Config,
}

impl fmt::Debug for S3Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Remote")
            .field("bucket", &self.config.bucket)
            .field("endpoint_url", &self.config.endpoint_url)
            .field("region", &self.config.region)
            .finish()
    }
}

impl S3Remote {
    /// Builds the SDK client and validates bucket access with HeadBucket.
    pub async fn connect(config: S3Config) -> Result<Self, TransferError> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "xfer-engine",
        );

        let mut builder = S3ConfigBuilder::new()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let remote = Self {
            client: Client::from_conf(builder.build()),
            config,
        };
        remote.verify().await?;
        Ok(remote)
    }

    fn bucket_for<'a>(&'a self, locator: &'a RemoteLocator) -> &'a str {
        locator.bucket.as_deref().unwrap_or(&self.config.bucket)
    }
}

#[async_trait]
impl RemoteClient for S3Remote {
    fn scheme(&self) -> &'static str {
        "s3"
    }

    async fn verify(&self) -> Result<(), TransferError> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| match sdk_err("head_bucket", e) {
                TransferError::Transport { message, .. } => TransferError::Connection(message),
                other => other,
            })?;
        Ok(())
    }

    async fn stat(&self, locator: &RemoteLocator) -> Result<ObjectInfo, TransferError> {
        let resp = self
            .client
            .head_object()
            .bucket(self.bucket_for(locator))
            .key(&locator.key)
            .send()
            .await
            .map_err(|e| sdk_err("head_object", e))?;

        Ok(ObjectInfo {
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            etag: resp.e_tag().map(str::to_string),
            modified_at: resp.last_modified().map(|dt| dt.secs()),
        })
    }

    async fn list(&self, locator: &RemoteLocator) -> Result<Vec<RemoteEntry>, TransferError> {
        let bucket = self.bucket_for(locator).to_string();
        let mut prefix = locator.key.clone();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .delimiter("/");
            if !prefix.is_empty() {
                request = request.prefix(&prefix);
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| sdk_err("list_objects_v2", e))?;

            for cp in resp.common_prefixes() {
                if let Some(dir) = cp.prefix() {
                    entries.push(RemoteEntry {
                        key: dir.to_string(),
                        size: 0,
                        is_dir: true,
                        modified_at: None,
                    });
                }
            }

            for obj in resp.contents() {
                let key = obj.key().unwrap_or_default();
                // The folder marker for the listed prefix is not an entry.
                if key == prefix {
                    continue;
                }
                entries.push(RemoteEntry {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    is_dir: false,
                    modified_at: obj.last_modified().map(|dt| dt.secs()),
                });
            }

            if resp.is_truncated() == Some(true) {
                continuation_token = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(entries)
    }

    async fn get_stream(
        &self,
        locator: &RemoteLocator,
        start: u64,
    ) -> Result<ChunkStream, TransferError> {
        let mut request = self
            .client
            .get_object()
            .bucket(self.bucket_for(locator))
            .key(&locator.key);
        if start > 0 {
            request = request.range(format!("bytes={}-", start));
        }

        let resp = request.send().await.map_err(|e| sdk_err("get_object", e))?;

        let reader = resp.body.into_async_read();
        let stream = ReaderStream::with_capacity(reader, GET_CHUNK_SIZE).map(|chunk| {
            chunk.map_err(|e| TransferError::transport(format!("remote read failed: {}", e), true))
        });
        Ok(Box::pin(stream))
    }

    async fn put_stream(
        &self,
        locator: &RemoteLocator,
        mut source: ChunkStream,
        size_hint: Option<u64>,
        content_type: Option<&str>,
    ) -> Result<u64, TransferError> {
        let mut body = Vec::with_capacity(size_hint.unwrap_or(0) as usize);
        while let Some(chunk) = source.next().await {
            body.extend_from_slice(&chunk?);
        }
        let written = body.len() as u64;

        self.client
            .put_object()
            .bucket(self.bucket_for(locator))
            .key(&locator.key)
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_err("put_object", e))?;

        Ok(written)
    }

    async fn delete(&self, locator: &RemoteLocator) -> Result<(), TransferError> {
        self.client
            .delete_object()
            .bucket(self.bucket_for(locator))
            .key(&locator.key)
            .send()
            .await
            .map_err(|e| sdk_err("delete_object", e))?;
        Ok(())
    }

    async fn rename(
        &self,
        from: &RemoteLocator,
        to: &RemoteLocator,
    ) -> Result<(), TransferError> {
        // No native rename in the protocol: copy, then delete the source.
        let source_bucket = self.bucket_for(from).to_string();
        self.client
            .copy_object()
            .bucket(self.bucket_for(to))
            .key(&to.key)
            .copy_source(format!("{}/{}", source_bucket, from.key))
            .send()
            .await
            .map_err(|e| sdk_err("copy_object", e))?;

        self.delete(from).await
    }

    async fn mkdir(&self, locator: &RemoteLocator) -> Result<(), TransferError> {
        let mut key = locator.key.clone();
        if !key.ends_with('/') {
            key.push('/');
        }

        self.client
            .put_object()
            .bucket(self.bucket_for(locator))
            .key(key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| sdk_err("put_object", e))?;
        Ok(())
    }

    fn multipart(&self) -> Option<&dyn MultipartRemote> {
        Some(self)
    }
}

#[async_trait]
impl MultipartRemote for S3Remote {
    async fn create_session(
        &self,
        locator: &RemoteLocator,
        content_type: Option<&str>,
    ) -> Result<String, TransferError> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket_for(locator))
            .key(&locator.key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| sdk_err("create_multipart_upload", e))?;

        resp.upload_id().map(str::to_string).ok_or_else(|| {
            TransferError::transport("create_multipart_upload: no upload id returned", false)
        })
    }

    async fn upload_part(
        &self,
        locator: &RemoteLocator,
        session: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, TransferError> {
        let resp = self
            .client
            .upload_part()
            .bucket(self.bucket_for(locator))
            .key(&locator.key)
            .upload_id(session)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_err("upload_part", e))?;

        Ok(UploadedPart {
            part_number,
            etag: resp.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_session(
        &self,
        locator: &RemoteLocator,
        session: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), TransferError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket_for(locator))
            .key(&locator.key)
            .upload_id(session)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| sdk_err("complete_multipart_upload", e))?;
        Ok(())
    }

    async fn abort_session(
        &self,
        locator: &RemoteLocator,
        session: &str,
    ) -> Result<(), TransferError> {
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket_for(locator))
            .key(&locator.key)
            .upload_id(session)
            .send()
            .await
            .map_err(|e| sdk_err("abort_multipart_upload", e))?;
        Ok(())
    }
}

/// Maps an SDK failure into the engine taxonomy without losing the error
/// code the service reported.
fn sdk_err<E, R>(context: &str, err: SdkError<E, R>) -> TransferError
where
    E: ProvideErrorMetadata,
{
    let (fallback, mut retryable) = match &err {
        SdkError::DispatchFailure(_) => ("request dispatch failed", true),
        SdkError::TimeoutError(_) => ("request timed out", true),
        SdkError::ResponseError(_) => ("malformed response", true),
        SdkError::ConstructionFailure(_) => ("request construction failed", false),
        _ => ("service error", false),
    };
    retryable = retryable
        || matches!(
            err.code(),
            Some("InternalError" | "SlowDown" | "ServiceUnavailable" | "RequestTimeout")
        );

    let detail = match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{} ({})", message, code),
        (Some(code), None) => code.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => fallback.to_string(),
    };

    TransferError::transport(format!("{}: {}", context, detail), retryable)
}

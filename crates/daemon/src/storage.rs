//! Object storage for staged sources, transcoder outputs and finished renders.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{StorageConfig, TimeoutConfig};
use crate::http::build_client;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Failed to fetch source {source_ref}: {message}")]
    FetchFailed { source_ref: String, message: String },

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("AWS SDK error: {0}")]
    AwsSdk(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Object store used by the pipeline.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload a finished render and return its public URL.
    async fn upload(&self, local_path: &Path, name: &str) -> Result<String, StorageError>;

    /// Copy a source (URL or local path) into the bucket under `key`.
    async fn stage(&self, source_ref: &str, key: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Bucket holding staged and transcoded objects.
    fn bucket(&self) -> &str;

    /// URL under which `key` can be read.
    fn object_url(&self, key: &str) -> String;
}

/// File extension of a URL or path, without the dot.
///
/// Query strings and fragments are ignored; anything missing or longer than
/// four characters falls back to "mp4".
pub fn file_extension(source_ref: &str) -> String {
    let without_query = source_ref.split(['?', '#']).next().unwrap_or("");
    let filename = without_query.rsplit('/').next().unwrap_or("");

    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() < 5 => ext.to_lowercase(),
        _ => "mp4".to_string(),
    }
}

/// MIME type for a video file extension.
pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        "m4v" => "video/x-m4v",
        "ts" => "video/mp2t",
        "mts" => "video/avchd",
        "mpg" | "mpeg" => "video/mpeg",
        _ => "video/mp4",
    }
}

fn is_remote(source_ref: &str) -> bool {
    source_ref.starts_with("http://") || source_ref.starts_with("https://")
}

/// Request body for a source. Local files are streamed from disk.
async fn source_body(http: &reqwest::Client, source_ref: &str) -> Result<ByteStream, StorageError> {
    let fetch_err = |message: String| StorageError::FetchFailed {
        source_ref: source_ref.to_string(),
        message,
    };

    if !is_remote(source_ref) {
        debug!(source = %source_ref, "Streaming source from local path");
        return ByteStream::from_path(source_ref)
            .await
            .map_err(|e| fetch_err(e.to_string()));
    }

    debug!(source = %source_ref, "Downloading source");
    let response = http
        .get(source_ref)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| fetch_err(e.to_string()))?;
    let bytes = response.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
    Ok(ByteStream::from(bytes.to_vec()))
}

/// S3 (or S3-compatible) storage.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    http: reqwest::Client,
    bucket: String,
    region: String,
    public_base_url: Option<String>,
    output_prefix: String,
}

impl S3Storage {
    /// Create a client using the default AWS credential chain.
    ///
    /// Source downloads are bounded by the `fetch` and `connect` timeouts.
    pub async fn new(config: &StorageConfig, timeouts: &TimeoutConfig) -> reqwest::Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint_url.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            http: build_client(timeouts.fetch(), timeouts.connect())?,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            public_base_url: config
                .public_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            output_prefix: config.output_prefix.clone(),
        })
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn upload(&self, local_path: &Path, name: &str) -> Result<String, StorageError> {
        let key = format!("{}{}", self.output_prefix, name);
        let extension = file_extension(name);

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .content_type(content_type_for(&extension))
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        info!(path = %local_path.display(), key = %key, "Uploaded render");
        Ok(self.object_url(&key))
    }

    async fn stage(&self, source_ref: &str, key: &str) -> Result<(), StorageError> {
        let body = source_body(&self.http, source_ref).await?;
        let content_type = content_type_for(&file_extension(source_ref));
        debug!(key = %key, content_type, "Staging source");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;

        debug!(key = %key, "Deleted object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found || message.contains("NotFound") || message.contains("NoSuchKey") {
                    Ok(false)
                } else {
                    Err(StorageError::AwsSdk(message))
                }
            }
        }
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("https://cdn.example.com/a/clip.MOV?sig=abc"), "mov");
        assert_eq!(file_extension("/media/demo.webm#t=3"), "webm");
        assert_eq!(file_extension("https://cdn.example.com/stream"), "mp4");
        assert_eq!(file_extension("archive.backup"), "mp4");
        assert_eq!(file_extension(""), "mp4");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("mov"), "video/quicktime");
        assert_eq!(content_type_for("mkv"), "video/x-matroska");
        assert_eq!(content_type_for("mpeg"), "video/mpeg");
        assert_eq!(content_type_for("xyz"), "video/mp4");
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://cdn.example.com/a.mp4"));
        assert!(is_remote("http://localhost/a.mp4"));
        assert!(!is_remote("/tmp/a.mp4"));
    }

    #[tokio::test]
    async fn test_source_body_streams_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not really a video").unwrap();
        let http = reqwest::Client::new();

        let body = source_body(&http, path.to_str().unwrap()).await.unwrap();
        let collected = body.collect().await.unwrap().into_bytes();
        assert_eq!(&collected[..], b"not really a video");
    }

    #[tokio::test]
    async fn test_source_body_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.mp4");
        let http = reqwest::Client::new();

        let err = source_body(&http, missing.to_str().unwrap()).await.unwrap_err();
        match err {
            StorageError::FetchFailed { source_ref, .. } => {
                assert_eq!(source_ref, missing.to_str().unwrap())
            }
            other => panic!("expected FetchFailed, got {:?}", other),
        }
    }
}

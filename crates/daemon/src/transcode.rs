//! Remote transcoder client.
//!
//! The transcoder reads a staged object from the bucket and writes an H.264
//! rendition back under a new key. The call is synchronous from the
//! pipeline's point of view: it returns once the output object exists.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{TimeoutConfig, TranscodeConfig};
use crate::http::build_client;
use crate::storage::StorageError;

/// Error type for transcoding operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The HTTP request itself failed
    #[error("Transcoder request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The transcoder answered with an error
    #[error("Transcoder rejected the job: {0}")]
    Rejected(String),

    /// The response could not be understood
    #[error("Invalid transcoder response: {0}")]
    InvalidResponse(String),

    /// The call did not finish within the configured limit
    #[error("Transcode timed out after {0:?}")]
    Timeout(Duration),

    /// No transcoder endpoint configured
    #[error("No transcoder endpoint configured")]
    NotConfigured,

    /// Staging the source into the bucket failed
    #[error("Failed to stage source: {0}")]
    Staging(#[from] StorageError),
}

/// Encoder settings sent with every transcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeProfile {
    pub preset: String,
    pub crf: u8,
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            preset: "fast".to_string(),
            crf: 23,
        }
    }
}

impl From<&TranscodeConfig> for TranscodeProfile {
    fn from(config: &TranscodeConfig) -> Self {
        Self {
            preset: config.preset.clone(),
            crf: config.crf,
        }
    }
}

/// One transcode request: bucket object in, bucket object out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    pub bucket: String,
    pub input_key: String,
    pub output_key: String,
    pub profile: TranscodeProfile,
}

/// Converts a staged object into a compatible rendition.
#[async_trait]
pub trait RemoteTranscoder: Send + Sync {
    /// Transcode and return the key of the written output.
    async fn transcode(&self, job: &TranscodeJob) -> Result<String, TranscodeError>;
}

#[derive(Debug, Serialize)]
struct ObjectRef<'a> {
    bucket: &'a str,
    key: &'a str,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct TranscodeBody<'a> {
    input: ObjectRef<'a>,
    output: ObjectRef<'a>,
    options: &'a TranscodeProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscodeResponse {
    output_key: Option<String>,
    error: Option<String>,
}

/// Build the JSON body POSTed to the transcoder.
pub fn request_body(job: &TranscodeJob) -> serde_json::Value {
    let body = TranscodeBody {
        input: ObjectRef {
            bucket: &job.bucket,
            key: &job.input_key,
            content_type: None,
        },
        output: ObjectRef {
            bucket: &job.bucket,
            key: &job.output_key,
            content_type: Some("video/mp4"),
        },
        options: &job.profile,
    };
    // Plain structs of strings and integers always serialize.
    serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
}

/// Interpret the transcoder's reply.
///
/// A reply without `outputKey` falls back to the requested key; an `error`
/// field always wins.
fn parse_response(job: &TranscodeJob, raw: &str) -> Result<String, TranscodeError> {
    let response: TranscodeResponse = serde_json::from_str(raw)
        .map_err(|e| TranscodeError::InvalidResponse(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(TranscodeError::Rejected(error));
    }

    Ok(response
        .output_key
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| job.output_key.clone()))
}

/// [`RemoteTranscoder`] talking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTranscoder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTranscoder {
    /// Requests are bounded by the `transcode` and `connect` timeouts.
    pub fn new(endpoint: impl Into<String>, timeouts: &TimeoutConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeouts.transcode(), timeouts.connect())?,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteTranscoder for HttpTranscoder {
    async fn transcode(&self, job: &TranscodeJob) -> Result<String, TranscodeError> {
        debug!(
            endpoint = %self.endpoint,
            input = %job.input_key,
            output = %job.output_key,
            "Submitting transcode"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request_body(job))
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;

        if !status.is_success() {
            let message = parse_response(job, &raw)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(TranscodeError::Rejected(format!("{} ({})", message, status)));
        }

        let output_key = parse_response(job, &raw)?;
        info!(input = %job.input_key, output = %output_key, "Transcode finished");
        Ok(output_key)
    }
}

/// Transcoder used when no endpoint is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTranscoder;

#[async_trait]
impl RemoteTranscoder for DisabledTranscoder {
    async fn transcode(&self, _job: &TranscodeJob) -> Result<String, TranscodeError> {
        Err(TranscodeError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> TranscodeJob {
        TranscodeJob {
            bucket: "media".to_string(),
            input_key: "input/42-primary-1.mov".to_string(),
            output_key: "output/42-primary-1.mp4".to_string(),
            profile: TranscodeProfile::default(),
        }
    }

    #[test]
    fn test_request_body_shape() {
        let body = request_body(&job());

        assert_eq!(body["input"]["bucket"], "media");
        assert_eq!(body["input"]["key"], "input/42-primary-1.mov");
        assert!(body["input"].get("contentType").is_none());
        assert_eq!(body["output"]["key"], "output/42-primary-1.mp4");
        assert_eq!(body["output"]["contentType"], "video/mp4");
        assert_eq!(body["options"]["preset"], "fast");
        assert_eq!(body["options"]["crf"], 23);
    }

    #[test]
    fn test_profile_from_config() {
        let config = TranscodeConfig {
            preset: "medium".to_string(),
            crf: 28,
            ..Default::default()
        };
        let profile = TranscodeProfile::from(&config);
        assert_eq!(profile.preset, "medium");
        assert_eq!(profile.crf, 28);
    }

    #[test]
    fn test_parse_response_output_key() {
        let key = parse_response(&job(), r#"{"outputKey": "output/final.mp4"}"#).unwrap();
        assert_eq!(key, "output/final.mp4");
    }

    #[test]
    fn test_parse_response_defaults_to_requested_key() {
        let key = parse_response(&job(), r#"{"status": "done"}"#).unwrap();
        assert_eq!(key, "output/42-primary-1.mp4");
    }

    #[test]
    fn test_parse_response_error() {
        let err = parse_response(&job(), r#"{"error": "unsupported container"}"#).unwrap_err();
        assert!(matches!(err, TranscodeError::Rejected(msg) if msg == "unsupported container"));
    }

    #[test]
    fn test_parse_response_garbage() {
        assert!(matches!(
            parse_response(&job(), "<html>502</html>"),
            Err(TranscodeError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_transcoder_fails() {
        let result = DisabledTranscoder.transcode(&job()).await;
        assert!(matches!(result, Err(TranscodeError::NotConfigured)));
    }
}

//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Render queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of jobs rendering at the same time
    pub concurrency: u32,
    /// Retries after the first failed attempt of a job
    pub max_retries: u32,
    /// Seconds without queue progress before the queue reports unhealthy
    pub watchdog_secs: u64,
    /// Seconds to wait for in-flight jobs on shutdown
    pub shutdown_grace_secs: u64,
    /// Interval of the background health monitor
    pub health_probe_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_retries: 3,
            watchdog_secs: 300,
            shutdown_grace_secs: 30,
            health_probe_interval_secs: 10,
        }
    }
}

/// Upper bounds for the long-running external calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub render_secs: u64,
    /// Whole transcode call, staging included; also bounds the transcoder request
    pub transcode_secs: u64,
    /// One status store write
    pub status_secs: u64,
    /// Download of a remote source while staging
    pub fetch_secs: u64,
    /// TCP/TLS connect for every HTTP client
    pub connect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            render_secs: 1800,
            transcode_secs: 900,
            status_secs: 30,
            fetch_secs: 600,
            connect_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn render(&self) -> Duration {
        Duration::from_secs(self.render_secs)
    }

    pub fn transcode(&self) -> Duration {
        Duration::from_secs(self.transcode_secs)
    }

    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

/// Remote transcoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscodeConfig {
    /// HTTP endpoint of the transcoder function (None disables remote transcoding)
    pub endpoint: Option<String>,
    /// x264 preset passed to the transcoder
    pub preset: String,
    /// Constant rate factor passed to the transcoder
    pub crf: u8,
    /// Codecs the renderer cannot consume; sources using them are transcoded
    pub deny_codecs: Vec<String>,
    /// Object key prefix for staged transcoder inputs
    pub input_prefix: String,
    /// Object key prefix for transcoder outputs
    pub output_prefix: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            preset: "fast".to_string(),
            crf: 23,
            deny_codecs: vec!["hevc".to_string(), "h265".to_string()],
            input_prefix: "input/".to_string(),
            output_prefix: "output/".to_string(),
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom S3-compatible endpoint (None = AWS)
    pub endpoint_url: Option<String>,
    /// Base URL used to build public object URLs (None = virtual-hosted S3 URL)
    pub public_base_url: Option<String>,
    /// Object key prefix for finished renders
    pub output_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "video-transcoding-microservice".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            public_base_url: None,
            output_prefix: "renders/".to_string(),
        }
    }
}

/// Status store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    /// PostgREST base URL (None = log-only status sink)
    pub rest_url: Option<String>,
    pub api_key: Option<String>,
    pub table: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            rest_url: None,
            api_key: None,
            table: "generated_videos".to_string(),
        }
    }
}

/// Composition renderer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    /// Renderer executable
    pub program: String,
    /// Extra arguments placed before the spec/output arguments
    pub args: Vec<String>,
    /// Directory receiving rendered files
    pub output_dir: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: "render-composition".to_string(),
            args: Vec::new(),
            output_dir: PathBuf::from("out"),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RENDER_CONCURRENCY -> queue.concurrency
    /// - MAX_RETRIES -> queue.max_retries
    /// - PORT -> port of server.bind
    /// - AWS_S3_BUCKET_NAME -> storage.bucket
    /// - AWS_REGION -> storage.region
    /// - TRANSCODER_ENDPOINT -> transcode.endpoint
    /// - STATUS_REST_URL -> status.rest_url
    /// - STATUS_API_KEY -> status.api_key
    /// - LOG_LEVEL -> logging.level
    /// - LOG_JSON -> logging.json
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RENDER_CONCURRENCY") {
            if let Ok(concurrency) = val.parse::<u32>() {
                if concurrency > 0 {
                    self.queue.concurrency = concurrency;
                }
            }
        }

        if let Ok(val) = env::var("MAX_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.queue.max_retries = retries;
            }
        }

        if let Ok(val) = env::var("PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.bind = replace_port(&self.server.bind, port);
            }
        }

        if let Ok(val) = env::var("AWS_S3_BUCKET_NAME") {
            if !val.is_empty() {
                self.storage.bucket = val;
            }
        }

        if let Ok(val) = env::var("AWS_REGION") {
            if !val.is_empty() {
                self.storage.region = val;
            }
        }

        if let Ok(val) = env::var("TRANSCODER_ENDPOINT") {
            if !val.is_empty() {
                self.transcode.endpoint = Some(val);
            }
        }

        if let Ok(val) = env::var("STATUS_REST_URL") {
            if !val.is_empty() {
                self.status.rest_url = Some(val);
            }
        }

        if let Ok(val) = env::var("STATUS_API_KEY") {
            if !val.is_empty() {
                self.status.api_key = Some(val);
            }
        }

        if let Ok(val) = env::var("LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val;
            }
        }

        // Accept "true", "1", "yes" as true; "false", "0", "no" as false
        if let Ok(val) = env::var("LOG_JSON") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.logging.json = true,
                "false" | "0" | "no" => self.logging.json = false,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

/// Replace the port of a `host:port` bind string, keeping the host
fn replace_port(bind: &str, port: u16) -> String {
    let host = match bind.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => host,
        _ => "0.0.0.0",
    };
    format!("{}:{}", host, port)
}

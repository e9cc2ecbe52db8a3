use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the library service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Comic ingestion configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Serve from in-memory gateways instead of S3 and PostgreSQL
    #[serde(default)]
    pub in_memory: bool,
}

/// Object storage configuration (S3 or any S3-compatible provider)
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding covers and chapter images
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Signed URL expiration in seconds
    #[serde(default = "default_signed_url_expiry_secs")]
    pub signed_url_expiry_secs: u64,
    /// MIME types accepted for uploads
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Comic ingestion configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Chapters uploaded concurrently per submission
    #[serde(default = "default_chapter_concurrency")]
    pub chapter_concurrency: usize,
    /// Maximum request body size for comic submissions
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Delete chapter images that were uploaded before a failure
    #[serde(default = "default_true")]
    pub cleanup_chapter_blobs: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "library-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bucket() -> String {
    "comics".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_signed_url_expiry_secs() -> u64 {
    3600
}

fn default_allowed_content_types() -> Vec<String> {
    vec![
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "image/gif".to_string(),
    ]
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_chapter_concurrency() -> usize {
    4
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "library-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("storage.bucket", "comics")?
            .set_default("database.url", "")?
            .add_source(config::File::with_name("config/library").required(false))
            .add_source(config::File::with_name("/etc/panelingo/library").required(false))
            // LIBRARY__STORAGE__BUCKET -> storage.bucket
            .add_source(
                config::Environment::with_prefix("LIBRARY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("storage.allowed_content_types")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.service.in_memory && self.database.url.is_empty() {
            anyhow::bail!("database.url is required unless service.in_memory is set");
        }
        if self.storage.bucket.is_empty() {
            anyhow::bail!("storage.bucket must not be empty");
        }
        if self.storage.allowed_content_types.is_empty() {
            anyhow::bail!("storage.allowed_content_types must list at least one MIME type");
        }
        if self.ingestion.chapter_concurrency == 0 {
            anyhow::bail!("ingestion.chapter_concurrency must be at least 1");
        }
        Ok(())
    }

    /// Get signed URL expiry as Duration
    pub fn signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.signed_url_expiry_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            in_memory: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            signed_url_expiry_secs: default_signed_url_expiry_secs(),
            allowed_content_types: default_allowed_content_types(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chapter_concurrency: default_chapter_concurrency(),
            max_upload_bytes: default_max_upload_bytes(),
            cleanup_chapter_blobs: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors raised by storage gateways
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("object {path} not found in bucket {bucket}")]
    NotFound { bucket: String, path: String },

    #[error("object {path} already exists in bucket {bucket}")]
    AlreadyExists { bucket: String, path: String },

    #[error("content type {content_type} is not allowed in bucket {bucket}")]
    ContentTypeNotAllowed { bucket: String, content_type: String },

    #[error("storage provider error: {0}")]
    Provider(String),
}

/// Time-limited read link to a stored object
#[derive(Debug, Clone, PartialEq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Object storage operations used by the library
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Create `bucket` unless it exists. A concurrent creator winning the race
    /// counts as success.
    async fn ensure_bucket(
        &self,
        bucket: &str,
        allowed_content_types: &[String],
    ) -> Result<(), StorageError>;

    /// Store `bytes` under `path`. Never overwrites an existing object.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Mint a read URL valid for `ttl`. Fails if the object does not exist.
    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<SignedUrl, StorageError>;

    /// Remove an object. Removing an absent object succeeds.
    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError>;
}

/// Storage gateway backed by S3 or an S3-compatible provider
pub struct S3StorageGateway {
    client: S3Client,
    region: String,
    /// Upload allow-lists recorded per bucket
    allowed_content_types: RwLock<HashMap<String, Vec<String>>>,
}

impl S3StorageGateway {
    /// Create a new S3 storage gateway
    pub async fn new(config: &StorageConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 storage gateway initialized"
        );

        let mut allowed = HashMap::new();
        allowed.insert(config.bucket.clone(), config.allowed_content_types.clone());

        Self {
            client,
            region: config.region.clone(),
            allowed_content_types: RwLock::new(allowed),
        }
    }

    /// Check if an object exists
    async fn object_exists(&self, bucket: &str, path: &str) -> Result<bool, StorageError> {
        match self.client.head_object().bucket(bucket).key(path).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(provider_error("failed to check object existence", e))
                }
            }
        }
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(provider_error("failed to check bucket existence", e))
                }
            }
        }
    }

    async fn check_content_type(&self, bucket: &str, content_type: &str) -> Result<(), StorageError> {
        let allowed = self.allowed_content_types.read().await;
        match allowed.get(bucket) {
            Some(types) if !is_allowed_content_type(types, content_type) => {
                Err(StorageError::ContentTypeNotAllowed {
                    bucket: bucket.to_string(),
                    content_type: content_type.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StorageGateway for S3StorageGateway {
    #[instrument(skip(self, allowed_content_types))]
    async fn ensure_bucket(
        &self,
        bucket: &str,
        allowed_content_types: &[String],
    ) -> Result<(), StorageError> {
        self.allowed_content_types
            .write()
            .await
            .insert(bucket.to_string(), allowed_content_types.to_vec());

        if self.bucket_exists(bucket).await? {
            debug!(bucket = %bucket, "Bucket already exists");
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(bucket);

        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %bucket, "Created bucket");
                Ok(())
            }
            Err(e) => {
                let lost_race = e
                    .as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
                    .unwrap_or(false);
                if lost_race {
                    debug!(bucket = %bucket, "Bucket created concurrently");
                    Ok(())
                } else {
                    Err(provider_error("failed to create bucket", e))
                }
            }
        }
    }

    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.check_content_type(bucket, content_type).await?;

        if self.object_exists(bucket, path).await? {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        let size_bytes = bytes.len();

        // The conditional put closes the window between the HEAD check and the write
        let result = self
            .client
            .put_object()
            .bucket(bucket)
            .key(path)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .cache_control("max-age=3600")
            .if_none_match("*")
            .send()
            .await;

        if let Err(e) = result {
            let precondition_failed = e
                .raw_response()
                .map(|r| r.status().as_u16() == 412)
                .unwrap_or(false);
            if precondition_failed {
                return Err(StorageError::AlreadyExists {
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                });
            }
            return Err(provider_error("failed to upload object", e));
        }

        metrics::counter!("library.storage.uploads").increment(1);

        debug!(path = %path, size_bytes = size_bytes, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<SignedUrl, StorageError> {
        if !self.object_exists(bucket, path).await? {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| provider_error("failed to create presigning config", e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(path)
            .presigned(presigning_config)
            .await
            .map_err(|e| provider_error("failed to generate signed URL", e))?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expires_at: expiry_from_now(ttl)?,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| provider_error("failed to delete object", e))?;

        debug!(path = %path, "Object deleted");
        Ok(())
    }
}

fn provider_error<E: std::error::Error>(context: &str, err: E) -> StorageError {
    StorageError::Provider(format!("{context}: {}", DisplayErrorContext(err)))
}

/// Expiry instant of a URL minted now with the given lifetime
pub(crate) fn expiry_from_now(ttl: Duration) -> Result<DateTime<Utc>, StorageError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| StorageError::Provider(format!("invalid signed URL lifetime: {e}")))?;
    Ok(Utc::now() + ttl)
}

/// Whether `content_type` appears in the allow-list, ignoring case and parameters
pub fn is_allowed_content_type(allowed: &[String], content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    allowed.iter().any(|t| t.eq_ignore_ascii_case(essence))
}

/// Guess a content type from a file name extension
pub fn content_type_for_file_name(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

/// Allocates object paths following the bucket layout:
/// `covers/<timestamp>-<seq>-<token>-<filename>` and
/// `chapters/<comicId>/<timestamp>-<seq>-<token>-<filename>`.
///
/// The sequence number is unique for the lifetime of the allocator and the
/// random token separates concurrent service replicas.
#[derive(Debug, Default)]
pub struct ObjectPaths {
    sequence: AtomicU64,
}

impl ObjectPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path for a comic cover
    pub fn cover(&self, file_name: &str) -> String {
        format!("covers/{}", self.unique_name(file_name))
    }

    /// Path for a chapter image, namespaced under its comic
    pub fn chapter(&self, comic_id: Uuid, file_name: &str) -> String {
        format!("chapters/{}/{}", comic_id, self.unique_name(file_name))
    }

    fn unique_name(&self, file_name: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let token = Uuid::new_v4().simple().to_string();
        format!(
            "{timestamp}-{seq:06}-{token}-{name}",
            timestamp = Utc::now().timestamp_millis(),
            seq = seq,
            token = &token[..8],
            name = sanitize_file_name(file_name)
        )
    }
}

/// Sanitize a file name so it cannot escape its prefix
fn sanitize_file_name(file_name: &str) -> String {
    let sanitized: String = file_name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let trimmed = sanitized.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

//! S3-compatible storage client
//!
//! Wraps the AWS SDK for S3-compatible storage access.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    Client,
};

use crate::config::StorageConfig;
use crate::error::StorageError;

use super::BlobStore;

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "omnipdf-cleaner",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Test connection by checking if bucket exists
        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    DisplayErrorContext(&e)
                );
            }
        }

        Ok(Self { client, bucket })
    }
}

/// Map an SDK failure onto the storage error taxonomy
fn sdk_error<E, R>(action: &str, key: &str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return StorageError::ConnectionFailed(format!("{}", DisplayErrorContext(&err)));
    }
    match err.code() {
        Some("AccessDenied") => StorageError::AccessDenied(key.to_string()),
        Some("NoSuchBucket") => StorageError::BucketNotFound(key.to_string()),
        Some("NoSuchKey") | Some("NotFound") => StorageError::ObjectNotFound(key.to_string()),
        _ => StorageError::SdkError(format!(
            "Failed to {} {}: {}",
            action,
            key,
            DisplayErrorContext(&err)
        )),
    }
}

#[async_trait::async_trait]
impl BlobStore for S3Client {
    async fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => match sdk_error("head object", key, e) {
                StorageError::ObjectNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn delete_object(&self, key: &str) -> Result<bool, StorageError> {
        // S3 reports success for missing keys, so check first
        if !self.object_exists(key).await? {
            tracing::debug!(key = %key, bucket = %self.bucket, "Object already gone");
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("delete object", key, e))?;

        tracing::info!(key = %key, bucket = %self.bucket, "Deleted object");
        Ok(true)
    }
}

//! S3 and S3-compatible object storage.

use super::{ObjectStore, ObjectStoreConnector, StoreError};
use crate::job::StorageTarget;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::{debug, info};

const DEFAULT_REGION: &str = "us-east-1";

/// Error codes S3 uses to say an object does not exist.
const NOT_FOUND_CODES: &[&str] = &["404", "NoSuchKey", "NotFound"];

/// Builds [`S3ObjectStore`] clients from per-job static credentials.
#[derive(Debug, Clone, Default)]
pub struct S3Connector;

#[async_trait]
impl ObjectStoreConnector for S3Connector {
    async fn connect(&self, target: &StorageTarget) -> Result<Box<dyn ObjectStore>, StoreError> {
        Ok(Box::new(S3ObjectStore::new(target)?))
    }
}

/// Object store client backed by `aws-sdk-s3`.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(target: &StorageTarget) -> Result<Self, StoreError> {
        if target.access_key_id.is_empty() || target.secret_access_key.is_empty() {
            return Err(StoreError::Credentials(
                "access key id and secret access key are required".to_string(),
            ));
        }

        let credentials = Credentials::new(
            &target.access_key_id,
            &target.secret_access_key,
            None,
            None,
            "relay-daemon",
        );
        let region = target
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials);

        if let Some(endpoint) = target.endpoint_url.as_deref() {
            if url::Url::parse(endpoint).is_err() {
                return Err(StoreError::Config(format!(
                    "invalid endpoint URL '{}'",
                    endpoint
                )));
            }
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn key_exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let code = e.code().map(str::to_string);
                let not_found = code
                    .as_deref()
                    .is_some_and(|c| NOT_FOUND_CODES.contains(&c))
                    || e.as_service_error().is_some_and(|se| se.is_not_found());
                if not_found {
                    Ok(false)
                } else {
                    Err(StoreError::Probe {
                        key: key.to_string(),
                        detail: code.unwrap_or_else(|| e.to_string()),
                    })
                }
            }
        }
    }

    async fn upload(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<(), StoreError> {
        if !local_path.exists() {
            return Err(StoreError::SourceMissing(local_path.display().to_string()));
        }
        debug!("Uploading {} to {}/{}", local_path.display(), bucket, key);

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StoreError::Upload(e.to_string()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| match e.code() {
                Some(code) => StoreError::Upload(format!(
                    "{} (code: {})",
                    e.message().unwrap_or("no details"),
                    code
                )),
                None => StoreError::Upload(e.to_string()),
            })?;

        info!("Uploaded {} to {}/{}", local_path.display(), bucket, key);
        Ok(())
    }
}

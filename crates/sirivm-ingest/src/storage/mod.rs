//! Source object store
//!
//! The pipeline only needs two operations from the bucket: a paginated listing
//! and a whole-object download. [`ObjectStore`] is that seam; [`S3ObjectStore`]
//! is the production implementation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use chrono::{DateTime, Utc};
use sirivm_common::SourceKey;
use tracing::{debug, info, instrument, warn};

pub mod config;

pub use config::StorageConfig;

/// One listed object: its key and when it was last modified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: SourceKey,
    pub last_modified: DateTime<Utc>,
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Cursor for the next page; `None` once the listing is exhausted
    pub next_cursor: Option<String>,
}

/// Read access to the bucket holding the snapshot archives
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List one page of objects under `prefix`, starting at `cursor`
    async fn list_page(&self, prefix: &str, cursor: Option<&str>) -> Result<ListPage>;

    /// Download an object's full contents
    async fn get(&self, key: &SourceKey) -> Result<Vec<u8>>;
}

/// S3 (or S3-compatible) bucket
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    page_size: Option<i32>,
}

impl S3ObjectStore {
    pub async fn connect(config: &StorageConfig, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            path_style = config.path_style,
            "Initializing S3 client"
        );

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let Some((access_key, secret_key)) = config.static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "sirivm-ingest",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        info!(bucket = %bucket, "S3 client initialized");

        Self {
            client: Client::from_conf(s3_config),
            bucket,
            page_size: None,
        }
    }

    /// Request at most `page_size` keys per listing call
    pub fn with_page_size(mut self, page_size: Option<i32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_page(&self, prefix: &str, cursor: Option<&str>) -> Result<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix);

        if let Some(max) = self.page_size {
            request = request.max_keys(max);
        }
        if let Some(token) = cursor {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to list s3://{}/{}", self.bucket, prefix))?;

        let mut objects = Vec::with_capacity(response.contents().len());
        for object in response.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            let last_modified = object
                .last_modified()
                .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()));

            match last_modified {
                Some(last_modified) => objects.push(ObjectSummary {
                    key: SourceKey::new(key),
                    last_modified,
                }),
                None => warn!(source = %key, "Listed object has no last-modified time, skipping"),
            }
        }

        let next_cursor = response.next_continuation_token().map(str::to_string);
        if response.is_truncated().unwrap_or(false) && next_cursor.is_none() {
            return Err(anyhow!(
                "Listing of s3://{}/{} is truncated but has no continuation token",
                self.bucket,
                prefix
            ));
        }

        debug!(objects = objects.len(), has_more = next_cursor.is_some(), "Listed page");

        Ok(ListPage {
            objects,
            next_cursor,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &SourceKey) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .with_context(|| format!("Failed to download s3://{}/{}", self.bucket, key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "Downloaded object");

        Ok(data)
    }
}

//! Remote object store access.
//!
//! Artifacts are addressed by `scheme://bucket/key` URIs. [`get_filesystem`]
//! builds the configured backend on `object_store`: an S3 bucket (AWS or any
//! S3-compatible endpoint), or a local mirror directory.

pub mod publish;

pub use publish::DualDestination;

use crate::config::{RemoteBackend, RemoteConfig};
use crate::error::{PipelineError, PipelineResult};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Location of one object (or a key prefix) in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub scheme: String,
    pub bucket: String,
    /// Key without leading or trailing slashes; empty for the bucket root.
    pub key: String,
}

impl ObjectUri {
    /// Parse `scheme://bucket[/key]`.
    pub fn parse(uri: &str) -> PipelineResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| PipelineError::Config(format!("Not an object URI: {}", uri)))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));

        if scheme.is_empty() || bucket.is_empty() {
            return Err(PipelineError::Config(format!(
                "Object URI needs a scheme and a bucket: {}",
                uri
            )));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        })
    }

    /// Append a relative path to the key.
    pub fn join(&self, path: &str) -> Self {
        let path = path.trim_matches('/');
        let key = match (self.key.is_empty(), path.is_empty()) {
            (_, true) => self.key.clone(),
            (true, false) => path.to_string(),
            (false, false) => format!("{}/{}", self.key, path),
        };

        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key,
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}://{}", self.scheme, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
        }
    }
}

/// Handle on the remote destination: one object store bound to one bucket.
#[derive(Debug, Clone)]
pub struct RemoteFilesystem {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl RemoteFilesystem {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Local directory standing in for `bucket`, laid out as `<root>/<bucket>/<key>`.
    pub fn mirror(root: &Path, bucket: &str) -> PipelineResult<Self> {
        let dir = root.join(bucket);
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::store(&dir, e))?;
        let store = LocalFileSystem::new_with_prefix(&dir).map_err(|e| PipelineError::store(&dir, e))?;
        Ok(Self::new(Arc::new(store), bucket))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn location(&self, uri: &ObjectUri) -> PipelineResult<ObjectPath> {
        if uri.bucket != self.bucket {
            return Err(PipelineError::remote(
                uri.to_string(),
                format!("bucket is not {}", self.bucket),
            ));
        }
        Ok(ObjectPath::from(uri.key.as_str()))
    }

    /// Write an object, replacing any previous content.
    pub async fn put(&self, uri: &ObjectUri, bytes: &[u8]) -> PipelineResult<()> {
        debug!("PUT {} ({} bytes)", uri, bytes.len());
        let location = self.location(uri)?;
        self.store
            .put(&location, PutPayload::from(bytes.to_vec()))
            .await
            .map_err(|e| PipelineError::remote(uri.to_string(), e))?;
        Ok(())
    }

    /// Read an object; `None` when it does not exist.
    pub async fn get(&self, uri: &ObjectUri) -> PipelineResult<Option<Vec<u8>>> {
        debug!("GET {}", uri);
        let location = self.location(uri)?;
        match self.store.get(&location).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| PipelineError::remote(uri.to_string(), e))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(PipelineError::remote(uri.to_string(), e)),
        }
    }

    /// Delete an object; deleting a missing object succeeds.
    pub async fn delete(&self, uri: &ObjectUri) -> PipelineResult<()> {
        debug!("DELETE {}", uri);
        let location = self.location(uri)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(PipelineError::remote(uri.to_string(), e)),
        }
    }
}

/// S3 client for `bucket`; requests are SigV4-signed with the builder's credentials.
fn s3_store(
    config: &RemoteConfig,
    bucket: &str,
    builder: AmazonS3Builder,
) -> PipelineResult<AmazonS3> {
    let options = ClientOptions::new().with_timeout(Duration::from_secs(config.timeout_seconds));
    let mut builder = builder
        .with_bucket_name(bucket)
        .with_client_options(options)
        .with_allow_http(config.allow_http);
    if let Some(ref endpoint) = config.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if let Some(ref region) = config.region {
        builder = builder.with_region(region);
    }

    builder
        .build()
        .map_err(|e| PipelineError::Config(format!("Cannot build S3 client for {}: {}", bucket, e)))
}

/// Build the remote filesystem described by the configuration.
///
/// The bucket is taken from `base_uri`. S3 credentials come from the usual
/// `AWS_*` environment variables.
pub fn get_filesystem(config: &RemoteConfig) -> PipelineResult<RemoteFilesystem> {
    let base = ObjectUri::parse(&config.base_uri)?;

    match config.backend {
        RemoteBackend::S3 => {
            info!(
                "Using S3 bucket {} at {}",
                base.bucket,
                config.endpoint.as_deref().unwrap_or("the default AWS endpoint")
            );
            let store = s3_store(config, &base.bucket, AmazonS3Builder::from_env())?;
            Ok(RemoteFilesystem::new(Arc::new(store), base.bucket))
        }
        RemoteBackend::Mirror => {
            info!("Using mirror object store at {}", config.mirror_root.display());
            RemoteFilesystem::mirror(&config.mirror_root, &base.bucket)
        }
    }
}

use std::sync::Arc;

use object_store::{aws::AmazonS3Builder, path::Path, ObjectStore as _, PutPayload};

use crate::{
    config,
    store::{Store, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum ObjectError {
    #[error("Error in object storage request")]
    Request(#[from] object_store::Error),
}

/// S3-compatible endpoint.
#[derive(Clone)]
pub(crate) struct ObjectStorage {
    bucket_name: String,
    inner: Arc<object_store::aws::AmazonS3>,
}

impl ObjectStorage {
    pub(crate) fn build(config: &config::ObjectStorage) -> Result<Self, StoreError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(config.bucket_name.as_str())
            .with_region(config.region.as_str());

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint.as_str().trim_end_matches('/'))
                .with_allow_http(endpoint.scheme() == "http");
        }

        if let Some(access_key) = &config.access_key {
            builder = builder.with_access_key_id(access_key.as_str());
        }

        if let Some(secret_key) = &config.secret_key {
            builder = builder.with_secret_access_key(secret_key.as_str());
        }

        let inner = builder.build().map_err(ObjectError::from)?;

        Ok(ObjectStorage {
            bucket_name: config.bucket_name.clone(),
            inner: Arc::new(inner),
        })
    }
}

#[async_trait::async_trait]
impl Store for ObjectStorage {
    async fn health_check(&self) -> Result<(), StoreError> {
        match self.inner.head(&Path::from("health-check")).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(ObjectError::from(e).into()),
        }
    }

    #[tracing::instrument(skip(bytes))]
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.inner
            .put(&Path::from(key), PutPayload::from(bytes))
            .await
            .map_err(ObjectError::from)?;

        Ok(())
    }

    #[tracing::instrument]
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let result = self
            .inner
            .get(&Path::from(key))
            .await
            .map_err(ObjectError::from)?;

        let bytes = result.bytes().await.map_err(ObjectError::from)?;

        Ok(bytes.to_vec())
    }

    #[tracing::instrument]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner
            .delete(&Path::from(key))
            .await
            .map_err(ObjectError::from)?;

        Ok(())
    }
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("bucket_name", &self.bucket_name)
            .finish()
    }
}

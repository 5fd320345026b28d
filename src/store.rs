use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use crate::config;

pub(crate) mod file_store;
pub(crate) mod object_store;

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("Error in file store")]
    FileStore(#[source] file_store::FileError),

    #[error("Error in object store")]
    ObjectStore(#[source] object_store::ObjectError),

    #[error("Requested file is not found")]
    FileNotFound(#[source] std::io::Error),

    #[error("Requested object is not found")]
    ObjectNotFound(#[source] object_store::ObjectError),
}

impl StoreError {
    pub(crate) const fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound(_)) || matches!(self, Self::ObjectNotFound(_))
    }
}

impl From<file_store::FileError> for StoreError {
    fn from(value: file_store::FileError) -> Self {
        match value {
            file_store::FileError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::FileNotFound(e)
            }
            e => Self::FileStore(e),
        }
    }
}

impl From<object_store::ObjectError> for StoreError {
    fn from(value: object_store::ObjectError) -> Self {
        match value {
            e @ object_store::ObjectError::Request(::object_store::Error::NotFound { .. }) => {
                Self::ObjectNotFound(e)
            }
            e => Self::ObjectStore(e),
        }
    }
}

/// One named storage endpoint being measured.
#[async_trait::async_trait]
pub(crate) trait Store: Send + Sync + Debug {
    async fn health_check(&self) -> Result<(), StoreError>;

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub(crate) type ArcStore = Arc<dyn Store>;

/// The full set of configured endpoints, looked up by region label.
#[derive(Clone, Debug)]
pub(crate) struct Endpoints {
    inner: Arc<BTreeMap<String, ArcStore>>,
}

impl Endpoints {
    pub(crate) async fn open(endpoints: &[config::Endpoint]) -> Result<Self, StoreError> {
        let mut inner = BTreeMap::new();

        for endpoint in endpoints {
            let store: ArcStore = match &endpoint.store {
                config::EndpointStore::Filesystem { path } => {
                    Arc::new(file_store::FileStore::build(path.clone()).await?)
                }
                config::EndpointStore::ObjectStorage(object_storage) => {
                    Arc::new(object_store::ObjectStorage::build(object_storage)?)
                }
            };

            inner.insert(endpoint.label.clone(), store);
        }

        Ok(Endpoints {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn get(&self, label: &str) -> Option<&ArcStore> {
        self.inner.get(label)
    }

    pub(crate) fn labels(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub(crate) async fn health_check(&self) -> Result<(), StoreError> {
        for store in self.inner.values() {
            store.health_check().await?;
        }

        Ok(())
    }
}

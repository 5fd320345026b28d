use std::time::{Duration, Instant};

use crate::{
    future::WithTimeout,
    operations::OperationKind,
    store::{ArcStore, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum ProbeError {
    #[error("Probed object was not found")]
    NotFound,

    #[error("Probe timed out")]
    Timeout,

    #[error("Storage transport failure")]
    Transport(#[source] StoreError),
}

impl From<StoreError> for ProbeError {
    fn from(value: StoreError) -> Self {
        if value.is_not_found() {
            Self::NotFound
        } else {
            Self::Transport(value)
        }
    }
}

/// Runs one timed storage operation against one endpoint and returns the
/// wall-clock latency in milliseconds. A get reads the full body before the
/// clock stops; a put writes exactly `bytes` bytes of filler.
#[tracing::instrument(skip(store))]
pub(crate) async fn probe(
    store: &ArcStore,
    operation: OperationKind,
    bytes: u64,
    key: &str,
) -> Result<u64, ProbeError> {
    let start = Instant::now();

    match operation {
        OperationKind::Put => store.put_bytes(key, filler(bytes)).await?,
        OperationKind::Get => {
            let body = store.get_bytes(key).await?;
            drop(body);
        }
        OperationKind::Delete => store.delete(key).await?,
    }

    Ok(start.elapsed().as_millis() as u64)
}

pub(crate) async fn timed_probe(
    store: &ArcStore,
    operation: OperationKind,
    bytes: u64,
    key: &str,
    timeout: Duration,
) -> Result<u64, ProbeError> {
    match probe(store, operation, bytes, key).with_timeout(timeout).await {
        Ok(res) => res,
        Err(_) => Err(ProbeError::Timeout),
    }
}

fn filler(bytes: u64) -> Vec<u8> {
    vec![b'a'; bytes as usize]
}

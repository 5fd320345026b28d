use std::{collections::BTreeMap, ops::Bound, path::PathBuf, str::FromStr};

use sled::{Db, Tree};

use crate::{
    operations::{OperationKind, OperationsState},
    repo::{
        AggregateRepo, AggregatedView, AlreadyExists, FullRepo, LogEntry, LogRepo,
        PipelineDocument, PipelineRepo, RepoError, Sample, SamplePage, SampleRepo, StateRepo,
    },
};

macro_rules! b {
    ($self:ident.$ident:ident, $expr:expr) => {{
        let $ident = $self.$ident.clone();

        tokio::task::spawn_blocking(move || $expr)
            .await
            .map_err(SledError::from)?
            .map_err(SledError::from)?
    }};
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SledError {
    #[error("Error in database")]
    Sled(#[from] sled::Error),

    #[error("Invalid document json")]
    Document(#[from] serde_json::Error),

    #[error("Operation panicked")]
    Panic,
}

impl From<tokio::task::JoinError> for SledError {
    fn from(_: tokio::task::JoinError) -> Self {
        SledError::Panic
    }
}

#[derive(Clone)]
pub(crate) struct SledRepo {
    samples: Tree,
    hour_aggregates: Tree,
    day_aggregates: Tree,
    operations_state: Tree,
    pipeline: Tree,
    log: Tree,
    db: Db,
}

impl SledRepo {
    pub(crate) fn build(path: PathBuf, cache_capacity: u64) -> Result<Self, SledError> {
        let db = sled::Config::new()
            .cache_capacity(cache_capacity)
            .path(path)
            .open()?;

        Self::new(db)
    }

    pub(crate) fn new(db: Db) -> Result<Self, SledError> {
        Ok(SledRepo {
            samples: db.open_tree("storewatch-samples-tree")?,
            hour_aggregates: db.open_tree("storewatch-hour-aggregates-tree")?,
            day_aggregates: db.open_tree("storewatch-day-aggregates-tree")?,
            operations_state: db.open_tree("storewatch-operations-state-tree")?,
            pipeline: db.open_tree("storewatch-pipeline-tree")?,
            log: db.open_tree("storewatch-log-tree")?,
            db,
        })
    }
}

const PIPELINE_DOCUMENT_KEY: &str = "pipeline-document";

fn sample_key(minute_key: &str, origin: &str, operation: OperationKind, bytes: u64) -> String {
    format!("{minute_key}/{origin}/{}/{bytes}", operation.as_str())
}

// The sample value mirrors the metadata-bearing KV contract: an empty
// placeholder value with the per-endpoint latencies attached as metadata.
#[derive(serde::Deserialize, serde::Serialize)]
struct SampleEnvelope {
    value: String,
    metadata: BTreeMap<String, u64>,
}

fn parse_sample(key: &[u8], value: &[u8]) -> Option<Sample> {
    let key = std::str::from_utf8(key).ok()?;

    let mut parts = key.split('/');
    let minute_key = parts.next()?;
    let origin = parts.next()?;
    let operation = OperationKind::from_str(parts.next()?).ok()?;
    let bytes = parts.next()?.parse().ok()?;

    let envelope: SampleEnvelope = serde_json::from_slice(value).ok()?;

    Some(Sample {
        minute_key: minute_key.to_string(),
        origin: origin.to_string(),
        operation,
        bytes,
        latencies: envelope.metadata,
    })
}

#[async_trait::async_trait]
impl SampleRepo for SledRepo {
    #[tracing::instrument(skip(self))]
    async fn sample_exists(
        &self,
        minute_key: &str,
        origin: &str,
        operation: OperationKind,
        bytes: u64,
    ) -> Result<bool, RepoError> {
        let key = sample_key(minute_key, origin, operation, bytes);

        let exists = b!(self.samples, samples.contains_key(key));

        Ok(exists)
    }

    #[tracing::instrument(skip(self, sample))]
    async fn record_sample(&self, sample: Sample) -> Result<(), RepoError> {
        let key = sample_key(
            &sample.minute_key,
            &sample.origin,
            sample.operation,
            sample.bytes,
        );
        let envelope = serde_json::to_vec(&SampleEnvelope {
            value: String::new(),
            metadata: sample.latencies,
        })
        .map_err(SledError::from)?;

        b!(self.samples, samples.insert(key.as_bytes(), envelope));

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list_samples(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<SamplePage, RepoError> {
        let page = b!(self.samples, {
            let iter = match cursor {
                Some(cursor) => samples.range::<Vec<u8>, _>((
                    Bound::Excluded(cursor.into_bytes()),
                    Bound::Unbounded,
                )),
                None => samples.iter(),
            };

            let mut parsed = Vec::new();
            let mut last_key = None;
            let mut complete = true;

            for res in iter {
                let (key, value) = res?;

                if parsed.len() >= limit {
                    complete = false;
                    break;
                }

                last_key = Some(String::from_utf8_lossy(&key).to_string());
                if let Some(sample) = parse_sample(&key, &value) {
                    parsed.push(sample);
                }
            }

            Ok(SamplePage {
                samples: parsed,
                cursor: last_key,
                complete,
            }) as Result<SamplePage, SledError>
        });

        Ok(page)
    }
}

#[async_trait::async_trait]
impl AggregateRepo for SledRepo {
    #[tracing::instrument(skip(self, views))]
    async fn put_hour_views(
        &self,
        views: Vec<(String, AggregatedView)>,
    ) -> Result<(), RepoError> {
        let mut encoded = Vec::with_capacity(views.len());
        for (hour_key, view) in views {
            encoded.push((hour_key, serde_json::to_vec(&view).map_err(SledError::from)?));
        }

        b!(self.hour_aggregates, {
            for (hour_key, bytes) in encoded {
                hour_aggregates.insert(hour_key.as_bytes(), bytes)?;
            }

            Ok(()) as Result<(), SledError>
        });

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn hour_view(&self, hour_key: &str) -> Result<Option<AggregatedView>, RepoError> {
        let key = hour_key.to_string();

        let opt = b!(self.hour_aggregates, hour_aggregates.get(key.as_bytes()));

        if let Some(ivec) = opt {
            Ok(Some(
                serde_json::from_slice(&ivec).map_err(SledError::from)?,
            ))
        } else {
            Ok(None)
        }
    }

    #[tracing::instrument(skip(self, view))]
    async fn put_day_view(&self, day_key: &str, view: AggregatedView) -> Result<(), RepoError> {
        let key = day_key.to_string();
        let bytes = serde_json::to_vec(&view).map_err(SledError::from)?;

        b!(self.day_aggregates, day_aggregates.insert(key.as_bytes(), bytes));

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn day_view(&self, day_key: &str) -> Result<Option<AggregatedView>, RepoError> {
        let key = day_key.to_string();

        let opt = b!(self.day_aggregates, day_aggregates.get(key.as_bytes()));

        if let Some(ivec) = opt {
            Ok(Some(
                serde_json::from_slice(&ivec).map_err(SledError::from)?,
            ))
        } else {
            Ok(None)
        }
    }
}

#[async_trait::async_trait]
impl PipelineRepo for SledRepo {
    #[tracing::instrument(skip(self))]
    async fn pipeline_document(&self) -> Result<Option<PipelineDocument>, RepoError> {
        let opt = b!(self.pipeline, pipeline.get(PIPELINE_DOCUMENT_KEY));

        if let Some(ivec) = opt {
            Ok(Some(
                serde_json::from_slice(&ivec).map_err(SledError::from)?,
            ))
        } else {
            Ok(None)
        }
    }

    #[tracing::instrument(skip(self, document))]
    async fn put_pipeline_document(
        &self,
        document: PipelineDocument,
    ) -> Result<(), RepoError> {
        let bytes = serde_json::to_vec(&document).map_err(SledError::from)?;

        b!(self.pipeline, pipeline.insert(PIPELINE_DOCUMENT_KEY, bytes));

        Ok(())
    }
}

#[async_trait::async_trait]
impl StateRepo for SledRepo {
    #[tracing::instrument(skip(self))]
    async fn operations_state(
        &self,
        origin: &str,
    ) -> Result<Option<OperationsState>, RepoError> {
        let key = origin.to_string();

        let opt = b!(self.operations_state, operations_state.get(key.as_bytes()));

        if let Some(ivec) = opt {
            Ok(Some(
                serde_json::from_slice(&ivec).map_err(SledError::from)?,
            ))
        } else {
            Ok(None)
        }
    }

    #[tracing::instrument(skip(self, state))]
    async fn put_operations_state(
        &self,
        origin: &str,
        state: &OperationsState,
    ) -> Result<(), RepoError> {
        let key = origin.to_string();
        let bytes = serde_json::to_vec(state).map_err(SledError::from)?;

        b!(self.operations_state, operations_state.insert(key.as_bytes(), bytes));

        Ok(())
    }

    #[tracing::instrument(skip(self, state))]
    async fn create_operations_state(
        &self,
        origin: &str,
        state: &OperationsState,
    ) -> Result<Result<(), AlreadyExists>, RepoError> {
        let key = origin.to_string();
        let bytes = serde_json::to_vec(state).map_err(SledError::from)?;

        let res = b!(self.operations_state, {
            operations_state.compare_and_swap(
                key.as_bytes(),
                None as Option<&[u8]>,
                Some(bytes),
            )
        });

        Ok(res.map_err(|_| AlreadyExists))
    }
}

#[async_trait::async_trait]
impl LogRepo for SledRepo {
    #[tracing::instrument(skip(self, entry))]
    async fn append_log(&self, entry: LogEntry) -> Result<(), RepoError> {
        let key = entry.id.clone();
        let bytes = serde_json::to_vec(&entry).map_err(SledError::from)?;

        b!(self.log, log.insert(key.as_bytes(), bytes));

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, RepoError> {
        let entries = b!(self.log, {
            let entries = log
                .iter()
                .rev()
                .filter_map(Result::ok)
                .filter_map(|(_, ivec)| serde_json::from_slice(&ivec).ok())
                .take(limit)
                .collect::<Vec<LogEntry>>();

            Ok(entries) as Result<_, SledError>
        });

        Ok(entries)
    }
}

#[async_trait::async_trait]
impl FullRepo for SledRepo {
    async fn health_check(&self) -> Result<(), RepoError> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || db.contains_key("health-check"))
            .await
            .map_err(SledError::from)?
            .map_err(SledError::from)?;

        Ok(())
    }
}

impl std::fmt::Debug for SledRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledRepo").finish()
    }
}

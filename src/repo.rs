use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use uuid::Uuid;

use crate::{
    operations::{OperationKind, OperationsState},
    time_key,
};

pub(crate) mod sled;

pub(crate) type ArcRepo = Arc<dyn FullRepo>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum RepoError {
    #[error("Error in database")]
    Sled(#[from] crate::repo::sled::SledError),
}

pub(crate) struct AlreadyExists;

/// One immutable minute-level measurement. The per-endpoint latencies ride
/// as record metadata; the record value itself is a placeholder.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub(crate) struct Sample {
    pub(crate) minute_key: String,
    pub(crate) origin: String,
    pub(crate) operation: OperationKind,
    pub(crate) bytes: u64,
    pub(crate) latencies: BTreeMap<String, u64>,
}

/// One page of a newest-first sample scan.
#[derive(Debug)]
pub(crate) struct SamplePage {
    pub(crate) samples: Vec<Sample>,
    pub(crate) cursor: Option<String>,
    pub(crate) complete: bool,
}

/// Hour- or day-level roll-up document: pair key `<origin>-><endpoint>` to
/// payload size to get/put latency lists, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub(crate) struct AggregatedView(
    pub(crate) BTreeMap<String, BTreeMap<u64, OperationLatencies>>,
);

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub(crate) struct OperationLatencies {
    pub(crate) get: Vec<u64>,
    pub(crate) put: Vec<u64>,
}

/// Pending day boundaries awaiting the daily roll-up, oldest first, plus
/// the single scheduled wake-up owned by the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub(crate) struct PipelineDocument {
    pub(crate) queue: Vec<i64>,
    pub(crate) scheduled_wake: Option<i64>,
}

/// Append-only diagnostic record.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub(crate) struct LogEntry {
    pub(crate) id: String,
    pub(crate) timestamp_ms: i64,
    pub(crate) stage: String,
    pub(crate) detail: String,
}

impl LogEntry {
    pub(crate) fn new(stage: &str, detail: String) -> Self {
        let timestamp_ms = time_key::now_ms();

        LogEntry {
            id: format!("{timestamp_ms}/{}", Uuid::new_v4()),
            timestamp_ms,
            stage: stage.to_string(),
            detail,
        }
    }
}

#[async_trait::async_trait]
pub(crate) trait SampleRepo: Send + Sync + Debug {
    async fn sample_exists(
        &self,
        minute_key: &str,
        origin: &str,
        operation: OperationKind,
        bytes: u64,
    ) -> Result<bool, RepoError>;

    async fn record_sample(&self, sample: Sample) -> Result<(), RepoError>;

    /// Newest-first scan over all samples. Pass the returned cursor back in
    /// to continue where the previous page left off.
    async fn list_samples(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<SamplePage, RepoError>;
}

#[async_trait::async_trait]
pub(crate) trait AggregateRepo: Send + Sync + Debug {
    /// Bulk overwrite of hour documents; one call per hourly run.
    async fn put_hour_views(
        &self,
        views: Vec<(String, AggregatedView)>,
    ) -> Result<(), RepoError>;

    async fn hour_view(&self, hour_key: &str) -> Result<Option<AggregatedView>, RepoError>;

    async fn put_day_view(&self, day_key: &str, view: AggregatedView) -> Result<(), RepoError>;

    async fn day_view(&self, day_key: &str) -> Result<Option<AggregatedView>, RepoError>;
}

#[async_trait::async_trait]
pub(crate) trait PipelineRepo: Send + Sync + Debug {
    async fn pipeline_document(&self) -> Result<Option<PipelineDocument>, RepoError>;

    async fn put_pipeline_document(&self, document: PipelineDocument) -> Result<(), RepoError>;
}

#[async_trait::async_trait]
pub(crate) trait StateRepo: Send + Sync + Debug {
    async fn operations_state(&self, origin: &str)
        -> Result<Option<OperationsState>, RepoError>;

    async fn put_operations_state(
        &self,
        origin: &str,
        state: &OperationsState,
    ) -> Result<(), RepoError>;

    /// Creates the document only if no other writer got there first.
    async fn create_operations_state(
        &self,
        origin: &str,
        state: &OperationsState,
    ) -> Result<Result<(), AlreadyExists>, RepoError>;
}

#[async_trait::async_trait]
pub(crate) trait LogRepo: Send + Sync + Debug {
    async fn append_log(&self, entry: LogEntry) -> Result<(), RepoError>;

    async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, RepoError>;
}

#[async_trait::async_trait]
pub(crate) trait FullRepo:
    SampleRepo + AggregateRepo + PipelineRepo + StateRepo + LogRepo
{
    async fn health_check(&self) -> Result<(), RepoError>;
}

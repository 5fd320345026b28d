use std::collections::BTreeMap;

use crate::{
    error::Error,
    init_metrics,
    operations::OperationKind,
    repo::{ArcRepo, Sample, SampleRepo},
};

/// Minute-level time-series writes with a duplicate-bucket guard. A bucket
/// that fails to write is abandoned; the next minute's cycle supersedes it.
#[derive(Clone, Debug)]
pub(crate) struct Recorder {
    repo: ArcRepo,
}

impl Recorder {
    pub(crate) fn new(repo: ArcRepo) -> Self {
        Recorder { repo }
    }

    pub(crate) async fn already_recorded(
        &self,
        minute_key: &str,
        origin: &str,
        operation: OperationKind,
        bytes: u64,
    ) -> Result<bool, Error> {
        let exists = self
            .repo
            .sample_exists(minute_key, origin, operation, bytes)
            .await?;

        Ok(exists)
    }

    /// Returns false when the minute bucket was already written and the
    /// sample was dropped.
    #[tracing::instrument(skip(self, latencies))]
    pub(crate) async fn record(
        &self,
        minute_key: &str,
        origin: &str,
        operation: OperationKind,
        bytes: u64,
        latencies: BTreeMap<String, u64>,
    ) -> Result<bool, Error> {
        if self
            .already_recorded(minute_key, origin, operation, bytes)
            .await?
        {
            metrics::counter!(init_metrics::SAMPLES_SKIPPED).increment(1);
            return Ok(false);
        }

        self.repo
            .record_sample(Sample {
                minute_key: minute_key.to_string(),
                origin: origin.to_string(),
                operation,
                bytes,
                latencies,
            })
            .await?;

        metrics::counter!(init_metrics::SAMPLES_RECORDED).increment(1);

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::Recorder;
    use crate::{
        operations::OperationKind,
        repo::{sled::SledRepo, ArcRepo, SampleRepo},
    };
    use std::{collections::BTreeMap, sync::Arc};

    fn test_repo() -> ArcRepo {
        let db = ::sled::Config::new()
            .temporary(true)
            .open()
            .expect("open temporary sled");

        Arc::new(SledRepo::new(db).expect("build repo"))
    }

    #[tokio::test]
    async fn second_write_for_the_same_bucket_is_dropped() {
        let repo = test_repo();
        let recorder = Recorder::new(repo.clone());
        let latencies = BTreeMap::from([("AMS".to_string(), 17)]);

        let first = recorder
            .record("9007170921047971", "DFW", OperationKind::Put, 0, latencies.clone())
            .await
            .unwrap();
        assert!(first);

        assert!(recorder
            .already_recorded("9007170921047971", "DFW", OperationKind::Put, 0)
            .await
            .unwrap());

        let second = recorder
            .record(
                "9007170921047971",
                "DFW",
                OperationKind::Put,
                0,
                BTreeMap::from([("AMS".to_string(), 99)]),
            )
            .await
            .unwrap();
        assert!(!second);

        // the original sample is untouched
        let page = repo.list_samples(None, 10).await.unwrap();
        assert_eq!(page.samples.len(), 1);
        assert_eq!(page.samples[0].latencies, latencies);
    }
}

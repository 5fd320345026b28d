use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{
    error::{Error, ServiceError},
    future::WithMetrics,
    init_metrics,
    repo::{
        AggregateRepo, ArcRepo, LogEntry, LogRepo, PipelineDocument, PipelineRepo, Sample,
        SampleRepo,
    },
    sync::DropHandle,
    time_key::{self, DAY_MS, HOUR_MS},
};

pub(crate) mod fold;

/// Fixed delay before retrying a failed daily step.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// How far back from the top of the current hour the hourly scan reaches.
/// Generous on purpose: the sample store is eventually consistent and late
/// writes must still land in their hour.
const SCAN_WINDOW_HOURS: i64 = 3;

const SCAN_PAGE_SIZE: usize = 256;

#[derive(Debug, serde::Serialize)]
pub(crate) struct PipelineStatus {
    pub(crate) queue: Vec<i64>,
    pub(crate) scheduled_wake: Option<i64>,
    pub(crate) running: bool,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct HourlySummary {
    pub(crate) samples: usize,
    pub(crate) hours: usize,
}

enum Command {
    Hourly {
        scheduled_ms: i64,
        reply: oneshot::Sender<Result<HourlySummary, Error>>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
}

/// Handle for talking to the singleton pipeline actor.
#[derive(Clone)]
pub(crate) struct PipelineHandle {
    tx: mpsc::Sender<Command>,
}

impl PipelineHandle {
    pub(crate) async fn run_hourly(&self, scheduled_ms: i64) -> Result<HourlySummary, Error> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(Command::Hourly {
                scheduled_ms,
                reply,
            })
            .await
            .map_err(|_| ServiceError::PipelineClosed)?;

        rx.await.map_err(|_| ServiceError::PipelineClosed)?
    }

    pub(crate) async fn status(&self) -> Result<PipelineStatus, Error> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| ServiceError::PipelineClosed)?;

        rx.await.map_err(|_| ServiceError::PipelineClosed.into())
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle").finish()
    }
}

/// Spawns the aggregation pipeline actor. Exactly one instance owns the
/// pipeline document; every mutation goes through its command loop, so no
/// two steps ever run concurrently.
pub(crate) fn spawn(repo: ArcRepo) -> (PipelineHandle, DropHandle<()>) {
    let (tx, rx) = mpsc::channel(16);

    let task = crate::sync::abort_on_drop(crate::sync::spawn(
        "aggregation-pipeline",
        run(repo, rx),
    ));

    (PipelineHandle { tx }, task)
}

async fn run(repo: ArcRepo, mut rx: mpsc::Receiver<Command>) {
    let mut pipeline = Pipeline::new(repo);
    pipeline.rehydrate().await;

    loop {
        let wake = pipeline.alarm.map(|(_, at)| at);

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Hourly { scheduled_ms, reply }) => {
                    let res = pipeline
                        .hourly_step(scheduled_ms)
                        .with_metrics(init_metrics::HOURLY_DURATION)
                        .await;
                    let _ = reply.send(res);
                }
                Some(Command::Status { reply }) => {
                    let _ = reply.send(pipeline.status().await);
                }
                None => break,
            },
            _ = sleep_until_wake(wake) => pipeline.alarm_fired().await,
        }
    }
}

async fn sleep_until_wake(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn instant_for(wake_ms: i64) -> Instant {
    let delta_ms = (wake_ms - time_key::now_ms()).max(0);

    Instant::now() + Duration::from_millis(delta_ms as u64)
}

#[derive(Debug)]
enum DailyOutcome {
    Drained,
    Backlog,
}

struct Pipeline {
    repo: ArcRepo,
    alarm: Option<(i64, Instant)>,
    running: bool,
}

impl Pipeline {
    fn new(repo: ArcRepo) -> Self {
        Pipeline {
            repo,
            alarm: None,
            running: false,
        }
    }

    /// Re-arms the persisted wake-up after a cold start.
    async fn rehydrate(&mut self) {
        match self.repo.pipeline_document().await {
            Ok(Some(document)) => {
                if let Some(wake_ms) = document.scheduled_wake {
                    self.alarm = Some((wake_ms, instant_for(wake_ms)));
                    tracing::info!("Re-armed pipeline alarm for {wake_ms}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to rehydrate pipeline document: {e}");
                self.log("startup", format!("failed to read pipeline document: {e}"))
                    .await;
            }
        }
    }

    async fn status(&self) -> PipelineStatus {
        let document = match self.repo.pipeline_document().await {
            Ok(document) => document.unwrap_or_default(),
            Err(_) => PipelineDocument::default(),
        };

        PipelineStatus {
            queue: document.queue,
            scheduled_wake: self.alarm.map(|(wake_ms, _)| wake_ms).or(document.scheduled_wake),
            running: self.running,
        }
    }

    /// Folds the recent scan window into hour documents and queues the
    /// day's roll-up.
    #[tracing::instrument(skip(self))]
    async fn hourly_step(&mut self, scheduled_ms: i64) -> Result<HourlySummary, Error> {
        self.log("hourly", format!("starting hourly aggregation for {scheduled_ms}"))
            .await;

        let hour_top = time_key::hour_floor(scheduled_ms);
        let window_start = hour_top - SCAN_WINDOW_HOURS * HOUR_MS;

        let samples = self.collect_window(window_start, hour_top).await?;
        let hours = fold::fold_hours(&samples);

        let summary = HourlySummary {
            samples: samples.len(),
            hours: hours.len(),
        };

        self.repo
            .put_hour_views(hours.into_iter().collect())
            .await?;

        let day_boundary = time_key::day_end_boundary(scheduled_ms);

        let mut document = self.repo.pipeline_document().await?.unwrap_or_default();
        if !document.queue.contains(&day_boundary) {
            document.queue.push(day_boundary);
        }

        // wake at the oldest pending day; never more than one alarm
        let head = document.queue.first().copied().unwrap_or(day_boundary);
        let wake_ms = document.scheduled_wake.unwrap_or(head);
        document.scheduled_wake = Some(wake_ms);
        self.repo.put_pipeline_document(document).await?;

        if self.alarm.is_none() {
            self.alarm = Some((wake_ms, instant_for(wake_ms)));
        }

        metrics::counter!(init_metrics::HOURLY_RUNS).increment(1);
        self.log(
            "hourly",
            format!(
                "completed hourly aggregation: {} samples into {} hours",
                summary.samples, summary.hours
            ),
        )
        .await;

        Ok(summary)
    }

    /// Collects every sample inside `[window_start, hour_top)`. The scan is
    /// newest-first, so the first entry older than the window ends it.
    async fn collect_window(
        &self,
        window_start: i64,
        hour_top: i64,
    ) -> Result<Vec<Sample>, Error> {
        let mut collected = Vec::new();
        let mut cursor = None;

        loop {
            let page = self.repo.list_samples(cursor, SCAN_PAGE_SIZE).await?;

            for sample in page.samples {
                let Some(time_ms) = time_key::minute_key_to_ms(&sample.minute_key) else {
                    continue;
                };

                if time_ms >= hour_top {
                    continue;
                }

                if time_ms < window_start {
                    return Ok(collected);
                }

                collected.push(sample);
            }

            if page.complete {
                return Ok(collected);
            }

            cursor = page.cursor;
        }
    }

    async fn alarm_fired(&mut self) {
        if self.running {
            // re-entrant fire while a daily step is in flight
            tracing::debug!("Alarm fired while the daily step is running; ignoring");
            return;
        }

        self.running = true;
        self.alarm = None;

        let outcome = self
            .daily_step()
            .with_metrics(init_metrics::DAILY_DURATION)
            .await;

        self.running = false;

        match outcome {
            Ok(DailyOutcome::Drained) => {}
            Ok(DailyOutcome::Backlog) => self.arm(time_key::now_ms()).await,
            Err(e) => {
                if matches!(e.kind(), Some(ServiceError::QueueEmpty)) {
                    self.log("daily", "queue empty at daily aggregation; rescheduling".to_string())
                        .await;
                } else {
                    tracing::error!("Daily aggregation failed: {e:?}");
                    self.log("daily", format!("daily aggregation failed: {e}"))
                        .await;
                }

                metrics::counter!(init_metrics::AGGREGATION_RETRIES).increment(1);
                self.arm(time_key::now_ms() + RETRY_DELAY.as_millis() as i64)
                    .await;
            }
        }
    }

    /// Merges the head day's 24 hour documents into one day document, then
    /// pops the queue head only after re-confirming it is still present in
    /// the persisted queue.
    #[tracing::instrument(skip(self))]
    async fn daily_step(&mut self) -> Result<DailyOutcome, Error> {
        self.log("daily", "starting daily aggregation".to_string())
            .await;

        let document = self.repo.pipeline_document().await?.unwrap_or_default();
        let Some(&day_boundary) = document.queue.first() else {
            return Err(ServiceError::QueueEmpty.into());
        };

        let day_start = day_boundary - DAY_MS;

        let mut hour_views = Vec::with_capacity(24);
        for hour in 0..24 {
            let hour_key = time_key::hour_key(day_start + hour * HOUR_MS);

            if let Some(view) = self.repo.hour_view(&hour_key).await? {
                hour_views.push(view);
            }
        }

        let merged = fold::merge_views(hour_views);
        let day_key = time_key::day_key(day_start);
        self.repo.put_day_view(&day_key, merged).await?;

        // Guard against lost updates: the queue may have been mutated while
        // this step ran, so only remove the entry we actually processed.
        let mut latest = self.repo.pipeline_document().await?.unwrap_or_default();
        if let Some(index) = latest.queue.iter().position(|entry| *entry == day_boundary) {
            latest.queue.remove(index);
        } else {
            self.log(
                "daily",
                format!("day {day_boundary} vanished from the queue before removal"),
            )
            .await;
        }

        let outcome = if latest.queue.is_empty() {
            latest.scheduled_wake = None;
            DailyOutcome::Drained
        } else {
            DailyOutcome::Backlog
        };

        self.repo.put_pipeline_document(latest).await?;

        metrics::counter!(init_metrics::DAILY_RUNS).increment(1);
        self.log(
            "daily",
            format!("completed daily aggregation for {day_boundary}"),
        )
        .await;

        Ok(outcome)
    }

    /// Arms the single wake-up, persisting it so a restart re-arms.
    async fn arm(&mut self, wake_ms: i64) {
        self.alarm = Some((wake_ms, instant_for(wake_ms)));

        match self.repo.pipeline_document().await {
            Ok(document) => {
                let mut document = document.unwrap_or_default();
                document.scheduled_wake = Some(wake_ms);

                if let Err(e) = self.repo.put_pipeline_document(document).await {
                    tracing::warn!("Failed to persist pipeline wake-up: {e}");
                }
            }
            Err(e) => tracing::warn!("Failed to read pipeline document while arming: {e}"),
        }
    }

    // Diagnostics are best effort; losing one must not fail the step.
    async fn log(&self, stage: &str, detail: String) {
        if let Err(e) = self.repo.append_log(LogEntry::new(stage, detail)).await {
            tracing::warn!("Failed to append diagnostic log entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fold, DailyOutcome, Pipeline, RETRY_DELAY};
    use crate::{
        error::ServiceError,
        operations::OperationKind,
        repo::{
            sled::SledRepo, AggregateRepo, ArcRepo, LogRepo, PipelineDocument, PipelineRepo,
            Sample, SampleRepo,
        },
        time_key::{self, DAY_MS, HOUR_MS, MINUTE_MS},
    };
    use std::{collections::BTreeMap, sync::Arc};

    fn test_repo() -> ArcRepo {
        let db = ::sled::Config::new()
            .temporary(true)
            .open()
            .expect("open temporary sled");

        Arc::new(SledRepo::new(db).expect("build repo"))
    }

    fn sample(time_ms: i64, operation: OperationKind, latency: u64) -> Sample {
        Sample {
            minute_key: time_key::minute_key(time_ms),
            origin: "DFW".to_string(),
            operation,
            bytes: 1_000_000,
            latencies: BTreeMap::from([("AMS".to_string(), latency)]),
        }
    }

    #[tokio::test]
    async fn hourly_step_folds_the_window_and_queues_the_day() {
        let repo = test_repo();
        let mut pipeline = Pipeline::new(repo.clone());

        let day_start = 19_500 * DAY_MS;
        let scheduled = day_start + 2 * HOUR_MS;

        repo.record_sample(sample(day_start, OperationKind::Put, 11))
            .await
            .unwrap();
        repo.record_sample(sample(
            day_start + HOUR_MS + MINUTE_MS,
            OperationKind::Get,
            22,
        ))
        .await
        .unwrap();
        // newer than the top of the scheduled hour; excluded from this run
        repo.record_sample(sample(scheduled + MINUTE_MS, OperationKind::Get, 33))
            .await
            .unwrap();

        let summary = pipeline.hourly_step(scheduled).await.unwrap();

        assert_eq!(summary.samples, 2);
        assert_eq!(summary.hours, 2);

        let first_hour = repo
            .hour_view(&time_key::hour_key(day_start))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first_hour.0[&fold::pair_key("DFW", "AMS")][&1_000_000].put,
            vec![11]
        );

        let document = repo.pipeline_document().await.unwrap().unwrap();
        assert_eq!(document.queue, vec![day_start + DAY_MS]);
        assert_eq!(document.scheduled_wake, Some(day_start + DAY_MS));
        assert_eq!(pipeline.alarm.map(|(ms, _)| ms), Some(day_start + DAY_MS));
    }

    #[tokio::test]
    async fn hourly_step_is_idempotent() {
        let repo = test_repo();
        let mut pipeline = Pipeline::new(repo.clone());

        let day_start = 19_500 * DAY_MS;
        let scheduled = day_start + HOUR_MS;

        repo.record_sample(sample(day_start + MINUTE_MS, OperationKind::Get, 7))
            .await
            .unwrap();

        pipeline.hourly_step(scheduled).await.unwrap();
        let first = repo
            .hour_view(&time_key::hour_key(day_start))
            .await
            .unwrap();

        pipeline.hourly_step(scheduled).await.unwrap();
        let second = repo
            .hour_view(&time_key::hour_key(day_start))
            .await
            .unwrap();

        assert_eq!(first, second);

        // the day boundary was not queued twice
        let document = repo.pipeline_document().await.unwrap().unwrap();
        assert_eq!(document.queue, vec![day_start + DAY_MS]);
    }

    #[tokio::test]
    async fn daily_step_merges_the_head_day_and_pops_the_queue() {
        let repo = test_repo();
        let mut pipeline = Pipeline::new(repo.clone());

        let day_start = 19_500 * DAY_MS;
        let boundary = day_start + DAY_MS;

        let views = (0..24)
            .map(|hour| {
                let mut view = crate::repo::AggregatedView::default();
                view.0
                    .entry(fold::pair_key("DFW", "AMS"))
                    .or_default()
                    .insert(
                        1_000_000,
                        crate::repo::OperationLatencies {
                            get: vec![hour as u64],
                            put: Vec::new(),
                        },
                    );
                (time_key::hour_key(day_start + hour * HOUR_MS), view)
            })
            .collect();
        repo.put_hour_views(views).await.unwrap();

        repo.put_pipeline_document(PipelineDocument {
            queue: vec![boundary],
            scheduled_wake: Some(boundary),
        })
        .await
        .unwrap();

        let outcome = pipeline.daily_step().await.unwrap();
        assert!(matches!(outcome, DailyOutcome::Drained));

        let day = repo
            .day_view(&time_key::day_key(day_start))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            day.0[&fold::pair_key("DFW", "AMS")][&1_000_000].get,
            (0..24u64).collect::<Vec<_>>()
        );

        let document = repo.pipeline_document().await.unwrap().unwrap();
        assert!(document.queue.is_empty());
        assert_eq!(document.scheduled_wake, None);
    }

    #[tokio::test]
    async fn daily_step_with_backlog_requests_another_run() {
        let repo = test_repo();
        let mut pipeline = Pipeline::new(repo.clone());

        let day_start = 19_500 * DAY_MS;

        repo.put_pipeline_document(PipelineDocument {
            queue: vec![day_start + DAY_MS, day_start + 2 * DAY_MS],
            scheduled_wake: Some(day_start + DAY_MS),
        })
        .await
        .unwrap();

        let outcome = pipeline.daily_step().await.unwrap();
        assert!(matches!(outcome, DailyOutcome::Backlog));

        let document = repo.pipeline_document().await.unwrap().unwrap();
        assert_eq!(document.queue, vec![day_start + 2 * DAY_MS]);
    }

    #[tokio::test]
    async fn empty_queue_fails_without_writing_and_reschedules_shortly() {
        let repo = test_repo();
        let mut pipeline = Pipeline::new(repo.clone());

        let err = pipeline.daily_step().await.unwrap_err();
        assert!(matches!(err.kind(), Some(ServiceError::QueueEmpty)));

        // the failed step itself wrote nothing
        assert!(repo.pipeline_document().await.unwrap().is_none());

        let before = time_key::now_ms();
        pipeline.alarm_fired().await;

        let (wake_ms, _) = pipeline.alarm.expect("alarm re-armed");
        assert!(wake_ms >= before);
        assert!(wake_ms <= time_key::now_ms() + RETRY_DELAY.as_millis() as i64);

        let logs = repo.recent_logs(10).await.unwrap();
        assert!(logs
            .iter()
            .any(|entry| entry.detail.contains("queue empty")));
    }

    #[tokio::test]
    async fn day_with_no_hour_documents_still_produces_a_day_document() {
        let repo = test_repo();
        let mut pipeline = Pipeline::new(repo.clone());

        let day_start = 19_500 * DAY_MS;
        let boundary = day_start + DAY_MS;

        repo.put_pipeline_document(PipelineDocument {
            queue: vec![boundary],
            scheduled_wake: Some(boundary),
        })
        .await
        .unwrap();

        let outcome = pipeline.daily_step().await.unwrap();
        assert!(matches!(outcome, DailyOutcome::Drained));

        let day = repo
            .day_view(&time_key::day_key(day_start))
            .await
            .unwrap()
            .unwrap();
        assert!(day.0.is_empty());
    }

    #[tokio::test]
    async fn rehydrate_re_arms_the_persisted_wake() {
        let repo = test_repo();

        repo.put_pipeline_document(PipelineDocument {
            queue: vec![42 * DAY_MS],
            scheduled_wake: Some(42 * DAY_MS),
        })
        .await
        .unwrap();

        let mut pipeline = Pipeline::new(repo);
        pipeline.rehydrate().await;

        assert_eq!(pipeline.alarm.map(|(ms, _)| ms), Some(42 * DAY_MS));
    }
}

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{Error, ServiceError},
    repo::{ArcRepo, StateRepo},
    schedule::PAYLOAD_SIZES,
};

/// Storage operations an origin can be asked to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OperationKind {
    Put,
    Get,
    Delete,
}

impl OperationKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub(crate) struct UnknownOperation;

impl std::str::FromStr for OperationKind {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "put" => Ok(Self::Put),
            "get" => Ok(Self::Get),
            "delete" => Ok(Self::Delete),
            _ => Err(UnknownOperation),
        }
    }
}

/// Next probe one anchor region must perform.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub(crate) struct Operation {
    pub(crate) kind: OperationKind,
    pub(crate) bytes: u64,
    pub(crate) object_key: String,
}

/// Prescribed operation per anchor region for one origin.
pub(crate) type OperationsState = BTreeMap<String, Operation>;

/// What an origin reports back after attempting a prescribed operation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub(crate) struct CompletionReport {
    pub(crate) success: bool,
    pub(crate) operation: OperationKind,
    pub(crate) bytes: u64,
    pub(crate) object_key: String,
}

pub(crate) type CompletionResults = BTreeMap<String, CompletionReport>;

fn fresh_object_key(origin: &str) -> String {
    format!("{origin}-{}", Uuid::new_v4())
}

fn initial_operation(origin: &str) -> Operation {
    Operation {
        kind: OperationKind::Put,
        bytes: PAYLOAD_SIZES[0],
        object_key: fresh_object_key(origin),
    }
}

// Flow: put -> get -> delete -> put at the next size with a fresh key
fn next_operation(origin: &str, operation: &Operation) -> Operation {
    match operation.kind {
        OperationKind::Put => Operation {
            kind: OperationKind::Get,
            ..operation.clone()
        },
        OperationKind::Get => Operation {
            kind: OperationKind::Delete,
            ..operation.clone()
        },
        OperationKind::Delete => {
            let bytes = PAYLOAD_SIZES
                .iter()
                .position(|bytes| *bytes == operation.bytes)
                .map(|index| PAYLOAD_SIZES[(index + 1) % PAYLOAD_SIZES.len()])
                .unwrap_or(PAYLOAD_SIZES[0]);

            Operation {
                kind: OperationKind::Put,
                bytes,
                object_key: fresh_object_key(origin),
            }
        }
    }
}

fn matches_prescribed(report: &CompletionReport, prescribed: &Operation) -> bool {
    report.operation == prescribed.kind
        && report.bytes == prescribed.bytes
        && report.object_key == prescribed.object_key
}

/// Owns every origin's prescribed-operation document. All access to one
/// origin's state is funnelled through that origin's entry lock, and the
/// in-memory copy is a read-through cache over the repo, so a cold start
/// always rehydrates from durable storage.
#[derive(Clone)]
pub(crate) struct OperationsManager {
    repo: ArcRepo,
    anchors: Arc<[String]>,
    origins: Arc<DashMap<String, Arc<Mutex<Option<OperationsState>>>>>,
}

impl OperationsManager {
    pub(crate) fn new(repo: ArcRepo, anchors: Vec<String>) -> Self {
        OperationsManager {
            repo,
            anchors: anchors.into(),
            origins: Arc::new(DashMap::new()),
        }
    }

    fn entry(&self, origin: &str) -> Arc<Mutex<Option<OperationsState>>> {
        self.origins
            .entry(origin.to_string())
            .or_default()
            .clone()
    }

    // Must be called with the origin's entry lock held. Creates and
    // persists the initial document on first access; losing the create
    // race to another writer falls back to reading their document.
    async fn load(
        &self,
        origin: &str,
        cached: &mut Option<OperationsState>,
    ) -> Result<OperationsState, Error> {
        if let Some(state) = cached.as_ref() {
            return Ok(state.clone());
        }

        if let Some(state) = self.repo.operations_state(origin).await? {
            *cached = Some(state.clone());
            return Ok(state);
        }

        let state: OperationsState = self
            .anchors
            .iter()
            .map(|region| (region.clone(), initial_operation(origin)))
            .collect();

        let state = match self.repo.create_operations_state(origin, &state).await? {
            Ok(()) => state,
            Err(_) => self
                .repo
                .operations_state(origin)
                .await?
                .ok_or(ServiceError::MissingState)?,
        };

        *cached = Some(state.clone());
        Ok(state)
    }

    pub(crate) async fn current_state(&self, origin: &str) -> Result<OperationsState, Error> {
        let entry = self.entry(origin);
        let mut cached = entry.lock().await;

        self.load(origin, &mut cached).await
    }

    /// Advances each anchor slot iff the report carries a success for the
    /// exact operation currently prescribed; stale or failed reports leave
    /// the slot untouched so the same operation is retried next cycle.
    #[tracing::instrument(skip(self, results))]
    pub(crate) async fn report_completion(
        &self,
        origin: &str,
        results: &CompletionResults,
    ) -> Result<OperationsState, Error> {
        let entry = self.entry(origin);
        let mut cached = entry.lock().await;

        let current = self.load(origin, &mut cached).await?;

        let next: OperationsState = current
            .iter()
            .map(|(region, prescribed)| {
                let advanced = results
                    .get(region)
                    .filter(|report| report.success && matches_prescribed(report, prescribed))
                    .map(|_| next_operation(origin, prescribed))
                    .unwrap_or_else(|| prescribed.clone());

                (region.clone(), advanced)
            })
            .collect();

        self.repo.put_operations_state(origin, &next).await?;
        *cached = Some(next.clone());

        Ok(next)
    }
}

impl std::fmt::Debug for OperationsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationsManager")
            .field("anchors", &self.anchors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CompletionReport, CompletionResults, OperationKind, OperationsManager, PAYLOAD_SIZES,
    };
    use crate::repo::{sled::SledRepo, ArcRepo};
    use std::sync::Arc;

    fn test_repo() -> ArcRepo {
        let db = ::sled::Config::new()
            .temporary(true)
            .open()
            .expect("open temporary sled");

        Arc::new(SledRepo::new(db).expect("build repo"))
    }

    fn manager() -> OperationsManager {
        OperationsManager::new(test_repo(), vec!["DFW".to_string(), "LHR".to_string()])
    }

    fn success_report(results: &super::OperationsState) -> CompletionResults {
        results
            .iter()
            .map(|(region, op)| {
                (
                    region.clone(),
                    CompletionReport {
                        success: true,
                        operation: op.kind,
                        bytes: op.bytes,
                        object_key: op.object_key.clone(),
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn initial_state_is_smallest_put_with_fresh_keys() {
        let manager = manager();

        let state = manager.current_state("AMS").await.unwrap();

        assert_eq!(state.len(), 2);
        for operation in state.values() {
            assert_eq!(operation.kind, OperationKind::Put);
            assert_eq!(operation.bytes, PAYLOAD_SIZES[0]);
            assert!(operation.object_key.starts_with("AMS-"));
        }
        assert_ne!(state["DFW"].object_key, state["LHR"].object_key);
    }

    #[tokio::test]
    async fn state_survives_a_cold_cache() {
        let db = ::sled::Config::new().temporary(true).open().unwrap();
        let repo: ArcRepo = Arc::new(SledRepo::new(db).unwrap());
        let anchors = vec!["DFW".to_string(), "LHR".to_string()];

        let first = OperationsManager::new(repo.clone(), anchors.clone());
        let state = first.current_state("SYD").await.unwrap();

        let second = OperationsManager::new(repo, anchors);
        assert_eq!(second.current_state("SYD").await.unwrap(), state);
    }

    #[tokio::test]
    async fn cycle_walks_the_full_ladder_and_wraps() {
        let manager = manager();
        let origin = "GRU";

        let initial = manager.current_state(origin).await.unwrap();
        let mut observed = Vec::new();

        // put/get/delete at every rung of the ladder before wrapping
        for _ in 0..3 * PAYLOAD_SIZES.len() {
            let state = manager.current_state(origin).await.unwrap();
            observed.push((state["DFW"].kind, state["DFW"].bytes));
            manager
                .report_completion(origin, &success_report(&state))
                .await
                .unwrap();
        }

        let expected: Vec<_> = PAYLOAD_SIZES
            .iter()
            .flat_map(|bytes| {
                [
                    (OperationKind::Put, *bytes),
                    (OperationKind::Get, *bytes),
                    (OperationKind::Delete, *bytes),
                ]
            })
            .collect();
        assert_eq!(observed, expected);

        // one full cycle later the ladder has wrapped back to the start
        let state = manager.current_state(origin).await.unwrap();
        assert_eq!(state["DFW"].kind, initial["DFW"].kind);
        assert_eq!(state["DFW"].bytes, initial["DFW"].bytes);
        assert_ne!(state["DFW"].object_key, initial["DFW"].object_key);
    }

    #[tokio::test]
    async fn failed_report_leaves_state_unchanged() {
        let manager = manager();

        let state = manager.current_state("MEX").await.unwrap();
        let mut results = success_report(&state);
        results.get_mut("DFW").unwrap().success = false;

        let next = manager.report_completion("MEX", &results).await.unwrap();

        assert_eq!(next["DFW"], state["DFW"]);
        assert_ne!(next["LHR"], state["LHR"]);
    }

    #[tokio::test]
    async fn stale_report_leaves_state_unchanged() {
        let manager = manager();

        let state = manager.current_state("ORD").await.unwrap();
        let mut results = success_report(&state);
        results.get_mut("DFW").unwrap().object_key = "ORD-someone-elses-key".to_string();
        results.get_mut("LHR").unwrap().bytes = PAYLOAD_SIZES[2];

        let next = manager.report_completion("ORD", &results).await.unwrap();

        assert_eq!(next, state);
    }

    #[tokio::test]
    async fn delete_completion_mints_a_fresh_key_at_the_next_size() {
        let manager = manager();
        let origin = "PNH";

        for _ in 0..2 {
            let state = manager.current_state(origin).await.unwrap();
            manager
                .report_completion(origin, &success_report(&state))
                .await
                .unwrap();
        }

        let before_delete = manager.current_state(origin).await.unwrap();
        assert_eq!(before_delete["DFW"].kind, OperationKind::Delete);

        let after = manager
            .report_completion(origin, &success_report(&before_delete))
            .await
            .unwrap();

        assert_eq!(after["DFW"].kind, OperationKind::Put);
        assert_eq!(after["DFW"].bytes, PAYLOAD_SIZES[1]);
        assert_ne!(after["DFW"].object_key, before_delete["DFW"].object_key);
    }
}

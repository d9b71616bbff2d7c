//! Store consistency checks: persisted checks driven by a poller, and the
//! on-demand single-flight layer-ids check.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::model::{CheckResult, CheckType, ConsistencyCheck};
use crate::provider::{CheckFailure, ConsistencyChecker};
use crate::scheduler::{TaskFactory, TaskFuture, TaskSource};

/// Oldest unstarted check that is at least `settle` old.
pub struct DueConsistencyChecks {
    pool: Pool,
    settle: Duration,
}

impl DueConsistencyChecks {
    pub fn new(pool: Pool, settle: Duration) -> Self {
        Self { pool, settle }
    }
}

#[async_trait]
impl TaskSource<ConsistencyCheck> for DueConsistencyChecks {
    async fn next_task(&self) -> Result<Option<ConsistencyCheck>> {
        let settle = chrono::Duration::from_std(self.settle)?;
        db::next_due_consistency_check(&self.pool, Utc::now() - settle).await
    }
}

pub struct ConsistencyCheckTaskFactory {
    pool: Pool,
    checker: Arc<dyn ConsistencyChecker>,
}

impl ConsistencyCheckTaskFactory {
    pub fn new(pool: Pool, checker: Arc<dyn ConsistencyChecker>) -> Self {
        Self { pool, checker }
    }
}

impl TaskFactory<ConsistencyCheck> for ConsistencyCheckTaskFactory {
    fn create(&self, check: ConsistencyCheck) -> Result<TaskFuture> {
        let pool = self.pool.clone();
        let checker = self.checker.clone();
        Ok(async move { run_check(&pool, checker.as_ref(), check).await.map(|_| ()) }.boxed())
    }
}

/// Marks the check started, runs it and records OK, NOT_OK or ERROR.
#[instrument(skip_all, fields(check_id = %check.id, check_type = check.check_type.as_str()))]
pub async fn run_check(
    pool: &Pool,
    checker: &dyn ConsistencyChecker,
    mut check: ConsistencyCheck,
) -> Result<ConsistencyCheck> {
    if !db::start_consistency_check(pool, &mut check).await? {
        debug!("consistency check already started elsewhere");
        return Ok(check);
    }
    let outcome = match (check.check_type, check.layer_id) {
        (CheckType::LayerIds, _) => checker.check_layer_ids().await,
        (CheckType::ListingRecords, Some(layer_id)) => checker.check_listing_records(layer_id).await,
        (CheckType::ListingRecords, None) => Err(CheckFailure::Error(anyhow!(
            "listing-records check requires a layer id"
        ))),
    };
    let (result, message) = match outcome {
        Ok(()) => {
            info!("consistency check passed");
            (CheckResult::Ok, None)
        }
        Err(CheckFailure::Mismatch(msg)) => {
            warn!(%msg, "consistency check found a mismatch");
            (CheckResult::NotOk, Some(msg))
        }
        Err(CheckFailure::Error(err)) => {
            error!(?err, "consistency check could not complete");
            (CheckResult::Error, Some(format!("{err:#}")))
        }
    };
    db::finish_consistency_check(pool, &mut check, result, message).await?;
    Ok(check)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayerIdsCheckStatus {
    Pending,
    Running,
    Ok,
    NotOk,
    Error,
}

impl LayerIdsCheckStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LayerIdsCheckStatus::Pending | LayerIdsCheckStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Idle,
    Pending(Uuid),
    Running(Uuid),
}

/// How many on-demand check outcomes stay queryable.
pub const RETAINED_LAYER_IDS_CHECKS: usize = 64;

#[derive(Debug)]
struct ManagerState {
    gate: Gate,
    statuses: HashMap<Uuid, LayerIdsCheckStatus>,
    /// Check ids, oldest first.
    order: VecDeque<Uuid>,
    retained: usize,
}

impl ManagerState {
    /// Registers a new check and forgets the oldest ones beyond `retained`.
    /// Only the newest check can still be active, so evicted ones are finished.
    fn admit(&mut self, id: Uuid) {
        self.statuses.insert(id, LayerIdsCheckStatus::Pending);
        self.order.push_back(id);
        while self.order.len() > self.retained {
            if let Some(old) = self.order.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }
}

/// Runs at most one layer-ids check at a time, outside the persisted queue.
#[derive(Clone)]
pub struct LayerIdsCheckManager {
    checker: Arc<dyn ConsistencyChecker>,
    state: Arc<Mutex<ManagerState>>,
}

fn lock(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opens the gate again however the check ends, including by panic.
struct GateRelease {
    state: Arc<Mutex<ManagerState>>,
    id: Uuid,
}

impl Drop for GateRelease {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(status) = state.statuses.get_mut(&self.id) {
            if !status.is_terminal() {
                *status = LayerIdsCheckStatus::Error;
            }
        }
        if matches!(state.gate, Gate::Pending(id) | Gate::Running(id) if id == self.id) {
            state.gate = Gate::Idle;
        }
    }
}

impl LayerIdsCheckManager {
    pub fn new(checker: Arc<dyn ConsistencyChecker>) -> Self {
        Self::with_retention(checker, RETAINED_LAYER_IDS_CHECKS)
    }

    pub fn with_retention(checker: Arc<dyn ConsistencyChecker>, retained: usize) -> Self {
        Self {
            checker,
            state: Arc::new(Mutex::new(ManagerState {
                gate: Gate::Idle,
                statuses: HashMap::new(),
                order: VecDeque::new(),
                retained: retained.max(1),
            })),
        }
    }

    pub fn has_active_or_pending(&self) -> bool {
        lock(&self.state).gate != Gate::Idle
    }

    /// Starts a check unless one is pending or running.
    pub fn try_schedule(&self) -> Option<Uuid> {
        let id = Uuid::new_v4();
        {
            let mut state = lock(&self.state);
            if state.gate != Gate::Idle {
                return None;
            }
            state.gate = Gate::Pending(id);
            state.admit(id);
        }

        let release = GateRelease {
            state: self.state.clone(),
            id,
        };
        let checker = self.checker.clone();
        tokio::spawn(async move {
            {
                let mut state = lock(&release.state);
                state.gate = Gate::Running(id);
                state.statuses.insert(id, LayerIdsCheckStatus::Running);
            }
            let status = match checker.check_layer_ids().await {
                Ok(()) => LayerIdsCheckStatus::Ok,
                Err(CheckFailure::Mismatch(msg)) => {
                    warn!(%id, %msg, "layer ids mismatch");
                    LayerIdsCheckStatus::NotOk
                }
                Err(CheckFailure::Error(err)) => {
                    error!(%id, ?err, "layer ids check failed");
                    LayerIdsCheckStatus::Error
                }
            };
            lock(&release.state).statuses.insert(id, status);
            drop(release);
        });
        Some(id)
    }

    pub fn status(&self, id: Uuid) -> Option<LayerIdsCheckStatus> {
        lock(&self.state).statuses.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    struct Gated {
        release: Arc<Notify>,
        outcome: fn() -> std::result::Result<(), CheckFailure>,
    }

    #[async_trait]
    impl ConsistencyChecker for Gated {
        async fn check_layer_ids(&self) -> std::result::Result<(), CheckFailure> {
            self.release.notified().await;
            (self.outcome)()
        }

        async fn check_listing_records(&self, _layer_id: i64) -> std::result::Result<(), CheckFailure> {
            Err(CheckFailure::Mismatch("layer 1: missing v2".into()))
        }
    }

    async fn wait_terminal(manager: &LayerIdsCheckManager, id: Uuid) -> LayerIdsCheckStatus {
        for _ in 0..200 {
            if let Some(s) = manager.status(id).filter(|s| s.is_terminal()) {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("check {id} did not finish");
    }

    #[tokio::test]
    async fn only_one_layer_ids_check_at_a_time() {
        let release = Arc::new(Notify::new());
        let manager = LayerIdsCheckManager::new(Arc::new(Gated {
            release: release.clone(),
            outcome: || Ok(()),
        }));

        let first = manager.try_schedule().unwrap();
        assert!(manager.has_active_or_pending());
        assert!(manager.try_schedule().is_none());

        release.notify_one();
        assert_eq!(wait_terminal(&manager, first).await, LayerIdsCheckStatus::Ok);
        assert!(!manager.has_active_or_pending());
        assert!(manager.try_schedule().is_some());
    }

    #[tokio::test]
    async fn mismatch_and_error_map_to_statuses() {
        let release = Arc::new(Notify::new());
        let manager = LayerIdsCheckManager::new(Arc::new(Gated {
            release: release.clone(),
            outcome: || Err(CheckFailure::Mismatch("top layer differs".into())),
        }));
        let id = manager.try_schedule().unwrap();
        release.notify_one();
        assert_eq!(wait_terminal(&manager, id).await, LayerIdsCheckStatus::NotOk);

        let manager = LayerIdsCheckManager::new(Arc::new(Gated {
            release: release.clone(),
            outcome: || Err(CheckFailure::Error(anyhow!("disk gone"))),
        }));
        let id = manager.try_schedule().unwrap();
        release.notify_one();
        assert_eq!(wait_terminal(&manager, id).await, LayerIdsCheckStatus::Error);
    }

    #[tokio::test]
    async fn panicking_check_reopens_the_gate() {
        let release = Arc::new(Notify::new());
        let manager = LayerIdsCheckManager::new(Arc::new(Gated {
            release: release.clone(),
            outcome: || panic!("checker bug"),
        }));
        let id = manager.try_schedule().unwrap();
        release.notify_one();
        assert_eq!(wait_terminal(&manager, id).await, LayerIdsCheckStatus::Error);
        assert!(!manager.has_active_or_pending());
    }

    #[tokio::test]
    async fn old_outcomes_are_forgotten() {
        let release = Arc::new(Notify::new());
        let manager = LayerIdsCheckManager::with_retention(
            Arc::new(Gated {
                release: release.clone(),
                outcome: || Ok(()),
            }),
            2,
        );
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = manager.try_schedule().unwrap();
            release.notify_one();
            assert_eq!(wait_terminal(&manager, id).await, LayerIdsCheckStatus::Ok);
            ids.push(id);
        }
        assert!(manager.status(ids[0]).is_none());
        assert_eq!(manager.status(ids[1]), Some(LayerIdsCheckStatus::Ok));
        assert_eq!(manager.status(ids[2]), Some(LayerIdsCheckStatus::Ok));
        assert_eq!(lock(&manager.state).statuses.len(), 2);
    }

    #[test]
    fn unknown_id_has_no_status() {
        let manager = LayerIdsCheckManager::new(Arc::new(Gated {
            release: Arc::new(Notify::new()),
            outcome: || Ok(()),
        }));
        assert!(manager.status(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn persisted_checks_record_results() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let checker = Gated {
            release: Arc::new(Notify::new()),
            outcome: || Ok(()),
        };

        let check = ConsistencyCheck::new(CheckType::ListingRecords, Some(1));
        db::insert_consistency_check(&pool, &check).await.unwrap();
        let done = run_check(&pool, &checker, check).await.unwrap();
        assert_eq!(done.result, Some(CheckResult::NotOk));
        assert_eq!(done.message.as_deref(), Some("layer 1: missing v2"));

        let check = ConsistencyCheck::new(CheckType::ListingRecords, None);
        db::insert_consistency_check(&pool, &check).await.unwrap();
        let done = run_check(&pool, &checker, check).await.unwrap();
        assert_eq!(done.result, Some(CheckResult::Error));

        let stored = db::get_consistency_check(&pool, done.id).await.unwrap().unwrap();
        assert!(stored.started.is_some() && stored.finished.is_some());
    }
}

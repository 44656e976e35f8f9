use crate::catalog::{Account, AccountStatus, CatalogError};
use crate::models::{
    ItemResult, JobPayload, JobRequest, Logistics, Region, RetryPolicy, TaskKind, TaskRecord,
    TaskStatus,
};
use crate::procedures::Procedures;
use crate::store::{StoreError, TaskStore};
use parking_lot::Mutex;
use rand::Rng;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("a {kind} job is already running ({existing})")]
    Conflict { kind: TaskKind, existing: Uuid },
    #[error("job {0} already finished")]
    AlreadyFinished(Uuid),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { kind, existing } => JobError::Conflict { kind, existing },
            StoreError::NotFound(id) => JobError::NotFound(format!("job {id} not found")),
            StoreError::AlreadyTerminal(id) => JobError::AlreadyFinished(id),
            other => JobError::Store(other),
        }
    }
}

impl From<CatalogError> for JobError {
    fn from(err: CatalogError) -> Self {
        JobError::NotFound(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub item_delay_min: Duration,
    pub item_delay_max: Duration,
    pub job_deadline: Duration,
    pub max_retry_attempts: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            item_delay_min: Duration::from_millis(1000),
            item_delay_max: Duration::from_millis(3000),
            job_deadline: Duration::from_secs(3600),
            max_retry_attempts: 3,
        }
    }
}

/// One unit of work, resolved at start so execution never re-reads the payload.
#[derive(Debug, Clone)]
enum WorkItem {
    Account(Account),
    Polish(String),
    Publish {
        product_id: String,
        account_id: Option<String>,
        region: Region,
    },
    Ship {
        order_id: String,
        logistics: Logistics,
    },
}

impl WorkItem {
    fn id(&self) -> &str {
        match self {
            WorkItem::Account(account) => &account.id,
            WorkItem::Polish(product_id) | WorkItem::Publish { product_id, .. } => product_id,
            WorkItem::Ship { order_id, .. } => order_id,
        }
    }
}

/// Integer percentage of items started, truncated.
fn progress_for(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (index * 100 / total).min(100) as u8
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    store: Arc<dyn TaskStore>,
    procedures: Procedures,
    controls: Mutex<HashMap<Uuid, CancellationToken>>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(store: Arc<dyn TaskStore>, procedures: Procedures, settings: RunnerSettings) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                procedures,
                controls: Mutex::new(HashMap::new()),
                settings,
            }),
        }
    }

    /// Validates and admits a job, then runs it in the background. Returns as
    /// soon as the Running record exists.
    pub async fn start(&self, owner: &str, request: JobRequest) -> Result<Uuid, JobError> {
        let kind = request.payload.kind();
        let items = self.plan(owner, request.payload).await?;
        if items.is_empty() {
            return Err(JobError::Validation(format!("{kind} job has no work items")));
        }
        let retry = request
            .retry
            .unwrap_or_default()
            .clamped(self.inner.settings.max_retry_attempts);

        let record = TaskRecord::running(owner, kind, items.len());
        let id = record.id;
        let token = CancellationToken::new();
        self.inner.controls.lock().insert(id, token.clone());
        if let Err(err) = self.inner.store.create(record).await {
            self.inner.controls.lock().remove(&id);
            return Err(err.into());
        }

        info!(target = "fleet.jobs", job_id = %id, owner = %owner, kind = %kind, total = items.len(), "job_started");
        let runner = self.clone();
        let owner = owner.to_string();
        tokio::spawn(async move {
            let job = tokio::spawn(
                runner
                    .clone()
                    .execute(id, owner.clone(), kind, items, retry, token),
            );
            if let Err(err) = job.await {
                runner.abandon(id, &owner, kind, err).await;
            }
        });
        Ok(id)
    }

    pub async fn status(&self, owner: &str, id: Uuid) -> Result<TaskRecord, JobError> {
        Ok(self.inner.store.get(id, owner).await?)
    }

    pub async fn list(&self, owner: &str) -> Vec<TaskRecord> {
        self.inner.store.list(owner).await
    }

    /// Signals a Running job to stop. The record turns Failed once the
    /// executing task observes the signal.
    pub async fn cancel(&self, owner: &str, id: Uuid) -> Result<TaskRecord, JobError> {
        let record = self.inner.store.get(id, owner).await?;
        if record.status.is_terminal() {
            return Err(JobError::AlreadyFinished(id));
        }
        if let Some(token) = self.inner.controls.lock().get(&id) {
            token.cancel();
        }
        info!(target = "fleet.jobs", job_id = %id, owner = %owner, "job_cancel_requested");
        Ok(record)
    }

    async fn plan(&self, owner: &str, payload: JobPayload) -> Result<Vec<WorkItem>, JobError> {
        let items = match payload {
            JobPayload::DailyTasks => self
                .inner
                .procedures
                .catalog()
                .accounts(owner)
                .await
                .into_iter()
                .filter(|account| account.status == AccountStatus::Active)
                .map(WorkItem::Account)
                .collect(),
            JobPayload::Polish { product_ids } | JobPayload::MidnightPolish { product_ids } => {
                product_ids.into_iter().map(WorkItem::Polish).collect()
            }
            JobPayload::Publish {
                product_ids,
                account_id,
                region,
            } => {
                if let Some(account_id) = &account_id {
                    self.inner
                        .procedures
                        .catalog()
                        .account(owner, account_id)
                        .await?;
                }
                product_ids
                    .into_iter()
                    .map(|product_id| WorkItem::Publish {
                        product_id,
                        account_id: account_id.clone(),
                        region,
                    })
                    .collect()
            }
            JobPayload::Ship {
                order_ids,
                logistics_company,
                logistics_number,
            } => {
                if logistics_company.trim().is_empty() || logistics_number.trim().is_empty() {
                    return Err(JobError::Validation(
                        "logistics_company and logistics_number are required".into(),
                    ));
                }
                let logistics = Logistics {
                    company: logistics_company,
                    number: logistics_number,
                };
                order_ids
                    .into_iter()
                    .map(|order_id| WorkItem::Ship {
                        order_id,
                        logistics: logistics.clone(),
                    })
                    .collect()
            }
        };
        Ok(items)
    }

    async fn execute(
        self,
        id: Uuid,
        owner: String,
        kind: TaskKind,
        items: Vec<WorkItem>,
        retry: RetryPolicy,
        token: CancellationToken,
    ) {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now().checked_add(self.inner.settings.job_deadline);
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err("cancelled".to_string()),
            _ = expiry => Err("deadline exceeded".to_string()),
            result = self.run_items(id, &owner, &items, retry) => result.map_err(|err| err.to_string()),
        };

        let finished = match outcome {
            Ok(results) => self.inner.store.complete(id, results).await,
            Err(reason) => self.inner.store.fail(id, reason).await,
        };
        self.inner.controls.lock().remove(&id);

        let elapsed_ms = started.elapsed().as_millis();
        match finished {
            Ok(record) => {
                let status = match record.status {
                    TaskStatus::Completed => "completed",
                    _ => "failed",
                };
                crate::metrics::job_finished(kind.as_str(), status, elapsed_ms);
                info!(
                    target = "fleet.jobs",
                    job_id = %id,
                    owner = %owner,
                    kind = %kind,
                    status,
                    error = record.error.as_deref().unwrap_or(""),
                    elapsed_ms = elapsed_ms as u64,
                    "job_finished"
                );
            }
            Err(err) => {
                error!(target = "fleet.jobs", job_id = %id, error = %err, "job_finalize_failed");
            }
        }
    }

    /// Finalizes a job whose execution task died without reaching a terminal
    /// state, so its running slot is released.
    async fn abandon(&self, id: Uuid, owner: &str, kind: TaskKind, err: JoinError) {
        let reason = if err.is_panic() {
            format!("panicked: {}", panic_message(err.into_panic()))
        } else {
            "aborted".to_string()
        };
        self.inner.controls.lock().remove(&id);
        match self.inner.store.fail(id, reason.clone()).await {
            Ok(_) => {
                crate::metrics::job_finished(kind.as_str(), "failed", 0);
                error!(target = "fleet.jobs", job_id = %id, owner = %owner, kind = %kind, error = %reason, "job_crashed");
            }
            Err(StoreError::AlreadyTerminal(_)) => {
                warn!(target = "fleet.jobs", job_id = %id, error = %reason, "job_crashed_after_finish");
            }
            Err(store_err) => {
                error!(target = "fleet.jobs", job_id = %id, error = %store_err, "job_finalize_failed");
            }
        }
    }

    async fn run_items(
        &self,
        id: Uuid,
        owner: &str,
        items: &[WorkItem],
        retry: RetryPolicy,
    ) -> Result<Vec<ItemResult>, StoreError> {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        for (index, item) in items.iter().enumerate() {
            self.inner
                .store
                .update_progress(id, progress_for(index, total))
                .await?;
            let started = Instant::now();
            let result = self.run_with_retry(owner, item, retry).await;
            crate::metrics::item_elapsed(item_kind(item), result.success, started.elapsed().as_millis());
            self.inner.store.append_result(id, result.clone()).await?;
            results.push(result);
            if index + 1 < total {
                self.pause().await;
            }
        }
        Ok(results)
    }

    async fn run_with_retry(&self, owner: &str, item: &WorkItem, retry: RetryPolicy) -> ItemResult {
        let mut attempt = 1;
        loop {
            let mut result = self.run_item(owner, item).await;
            result.attempts = attempt;
            match result.failure_reason() {
                Some(reason) if reason.is_retryable() && attempt < retry.max_attempts => {
                    debug!(target = "fleet.jobs", item = %item.id(), attempt, reason = %reason, "item_retry");
                    let backoff = retry.backoff_ms.saturating_mul(u64::from(attempt));
                    if backoff > 0 {
                        sleep(Duration::from_millis(backoff)).await;
                    }
                    attempt += 1;
                }
                _ => return result,
            }
        }
    }

    async fn run_item(&self, owner: &str, item: &WorkItem) -> ItemResult {
        let procedures = &self.inner.procedures;
        match item {
            WorkItem::Account(account) => procedures.daily_tasks(account).await,
            WorkItem::Polish(product_id) => procedures.polish(owner, product_id).await,
            WorkItem::Publish {
                product_id,
                account_id,
                region,
            } => {
                procedures
                    .publish(owner, product_id, account_id.as_deref(), *region)
                    .await
            }
            WorkItem::Ship {
                order_id,
                logistics,
            } => procedures.ship(owner, order_id, logistics).await,
        }
    }

    async fn pause(&self) {
        let min = self.inner.settings.item_delay_min.as_millis() as u64;
        let max = (self.inner.settings.item_delay_max.as_millis() as u64).max(min);
        if max == 0 {
            return;
        }
        let millis = rand::rng().random_range(min..=max);
        sleep(Duration::from_millis(millis)).await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "unknown panic".to_string(),
    }
}

fn item_kind(item: &WorkItem) -> &'static str {
    match item {
        WorkItem::Account(_) => "daily_tasks",
        WorkItem::Polish(_) => "polish",
        WorkItem::Publish { .. } => "publish",
        WorkItem::Ship { .. } => "ship",
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::automation::testing::ScriptedDriver;
    use crate::catalog::{CatalogSeed, MemoryCatalog};
    use crate::store::MemoryTaskStore;

    pub fn fast_settings() -> RunnerSettings {
        RunnerSettings {
            item_delay_min: Duration::ZERO,
            item_delay_max: Duration::ZERO,
            job_deadline: Duration::from_secs(60),
            max_retry_attempts: 3,
        }
    }

    pub fn runner(
        driver: ScriptedDriver,
        seed: CatalogSeed,
        settings: RunnerSettings,
    ) -> (JobRunner, Arc<MemoryCatalog>) {
        let (procedures, catalog) = crate::procedures::testing::procedures(driver, seed);
        let runner = JobRunner::new(Arc::new(MemoryTaskStore::new()), procedures, settings);
        (runner, catalog)
    }

    pub async fn wait_terminal(runner: &JobRunner, owner: &str, id: Uuid) -> TaskRecord {
        let poll = async {
            loop {
                let record = runner.status(owner, id).await.expect("status");
                if record.status != TaskStatus::Running {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .expect("job did not finish")
    }
}

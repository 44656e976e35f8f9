//! Recurring triggers. One entry per (owner, kind), kept in a
//! `ScheduleStore`; firing goes through the same `JobRunner::start` path an
//! API caller uses.

use crate::jobs::{JobError, JobRunner};
use crate::models::{JobPayload, TaskKind};
use crate::store::{ScheduleStore, StoreError};
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const MIN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{0} jobs cannot be scheduled")]
    Unsupported(TaskKind),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "snake_case")]
pub enum FireSpec {
    Daily { at: NaiveTime },
}

impl FireSpec {
    pub fn midnight() -> Self {
        FireSpec::Daily {
            at: NaiveTime::MIN,
        }
    }

    /// Parses `HH:MM`.
    pub fn parse_daily(raw: &str) -> Result<Self, ScheduleError> {
        NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .map(|at| FireSpec::Daily { at })
            .map_err(|_| ScheduleError::Invalid(format!("`{raw}` is not a HH:MM time")))
    }

    /// First occurrence strictly after `now`. Occurrences that were missed
    /// while the process was down are never returned.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let FireSpec::Daily { at } = self;
        let zone = now.timezone();
        let mut date = now.date_naive();
        for _ in 0..3 {
            if let Some(candidate) = date.and_time(*at).and_local_timezone(zone.clone()).earliest()
                && candidate > *now
            {
                return candidate;
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        now.clone() + chrono::Duration::days(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub owner: String,
    pub kind: TaskKind,
    pub fire: FireSpec,
    pub payload: JobPayload,
    pub next_fire: DateTime<Local>,
    pub last_fired: Option<DateTime<Local>>,
    pub last_job: Option<Uuid>,
}

#[derive(Clone)]
pub struct Scheduler {
    runner: JobRunner,
    store: Arc<dyn ScheduleStore>,
    // Held across every read-modify-write of the store.
    gate: Arc<Mutex<()>>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(runner: JobRunner, store: Arc<dyn ScheduleStore>, tick: Duration) -> Self {
        Self {
            runner,
            store,
            gate: Arc::new(Mutex::new(())),
            tick: tick.max(MIN_TICK),
        }
    }

    /// Reloads persisted entries at startup. Entries whose fire time passed
    /// while the process was down move to their next occurrence without
    /// firing. Returns how many entries were loaded.
    pub async fn restore(&self, now: DateTime<Local>) -> Result<usize, ScheduleError> {
        let _gate = self.gate.lock().await;
        let entries = self.store.all().await?;
        let loaded = entries.len();
        let mut advanced = 0;
        for mut entry in entries {
            if entry.next_fire <= now {
                entry.next_fire = entry.fire.next_after(&now);
                self.store.upsert(entry).await?;
                advanced += 1;
            }
        }
        info!(target = "fleet.scheduler", loaded, advanced, "schedules_restored");
        Ok(loaded)
    }

    /// Registers a trigger, replacing any existing one for the same key.
    pub async fn schedule(
        &self,
        owner: &str,
        fire: FireSpec,
        payload: JobPayload,
    ) -> Result<ScheduleEntry, ScheduleError> {
        let kind = payload.kind();
        match &payload {
            JobPayload::Publish { .. } | JobPayload::Ship { .. } => {
                return Err(ScheduleError::Unsupported(kind));
            }
            JobPayload::Polish { product_ids } | JobPayload::MidnightPolish { product_ids }
                if product_ids.is_empty() =>
            {
                return Err(ScheduleError::Invalid(format!(
                    "{kind} schedule needs at least one product"
                )));
            }
            _ => {}
        }

        let entry = ScheduleEntry {
            owner: owner.to_string(),
            kind,
            fire,
            payload,
            next_fire: fire.next_after(&Local::now()),
            last_fired: None,
            last_job: None,
        };
        let replaced = {
            let _gate = self.gate.lock().await;
            self.store.upsert(entry.clone()).await?
        };
        info!(
            target = "fleet.scheduler",
            owner = %owner,
            kind = %kind,
            next_fire = %entry.next_fire,
            replaced,
            "schedule_set"
        );
        Ok(entry)
    }

    pub async fn cancel(&self, owner: &str, kind: TaskKind) -> Result<bool, ScheduleError> {
        let removed = {
            let _gate = self.gate.lock().await;
            self.store.remove(owner, kind).await?
        };
        if removed {
            info!(target = "fleet.scheduler", owner = %owner, kind = %kind, "schedule_removed");
        }
        Ok(removed)
    }

    /// Enables or disables the trigger for `kind`. Returns the active entry,
    /// or `None` once disabled.
    pub async fn set(
        &self,
        owner: &str,
        kind: TaskKind,
        enabled: bool,
        product_ids: Vec<String>,
        at: Option<&str>,
    ) -> Result<Option<ScheduleEntry>, ScheduleError> {
        if !enabled {
            self.cancel(owner, kind).await?;
            return Ok(None);
        }
        let fire = match at {
            Some(raw) => FireSpec::parse_daily(raw)?,
            None => FireSpec::midnight(),
        };
        let payload = match kind {
            TaskKind::DailyTasks => JobPayload::DailyTasks,
            TaskKind::Polish => JobPayload::Polish { product_ids },
            TaskKind::MidnightPolish => JobPayload::MidnightPolish { product_ids },
            TaskKind::Publish | TaskKind::Ship => return Err(ScheduleError::Unsupported(kind)),
        };
        self.schedule(owner, fire, payload).await.map(Some)
    }

    pub async fn entries(&self, owner: &str) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let mut entries = self.store.list(owner).await?;
        entries.sort_by_key(|entry| entry.next_fire);
        Ok(entries)
    }

    /// Fires every entry due at `now` and advances it to its next occurrence.
    /// An entry whose job is still running from an earlier fire is skipped.
    pub async fn tick_at(&self, now: DateTime<Local>) -> Vec<Uuid> {
        let due = match self.advance_due(now).await {
            Ok(due) => due,
            Err(err) => {
                warn!(target = "fleet.scheduler", error = %err, "schedule_scan_failed");
                return Vec::new();
            }
        };

        let mut started = Vec::with_capacity(due.len());
        for entry in due {
            match self
                .runner
                .start(&entry.owner, entry.payload.clone().into())
                .await
            {
                Ok(id) => {
                    info!(target = "fleet.scheduler", owner = %entry.owner, kind = %entry.kind, job_id = %id, "schedule_fired");
                    self.record_last_job(&entry, id).await;
                    started.push(id);
                }
                Err(JobError::Conflict { existing, .. }) => {
                    info!(target = "fleet.scheduler", owner = %entry.owner, kind = %entry.kind, running = %existing, "schedule_skipped_running");
                }
                Err(err) => {
                    warn!(target = "fleet.scheduler", owner = %entry.owner, kind = %entry.kind, error = %err, "schedule_fire_failed");
                }
            }
        }
        started
    }

    /// Moves every due entry past `now` in the store before anything fires, so
    /// a failed write can never fire the same occurrence twice.
    async fn advance_due(&self, now: DateTime<Local>) -> Result<Vec<ScheduleEntry>, StoreError> {
        let _gate = self.gate.lock().await;
        let mut due = Vec::new();
        for mut entry in self.store.all().await? {
            if entry.next_fire > now {
                continue;
            }
            entry.last_fired = Some(now);
            entry.next_fire = entry.fire.next_after(&now);
            match self.store.upsert(entry.clone()).await {
                Ok(_) => due.push(entry),
                Err(err) => {
                    warn!(target = "fleet.scheduler", owner = %entry.owner, kind = %entry.kind, error = %err, "schedule_advance_failed");
                }
            }
        }
        Ok(due)
    }

    async fn record_last_job(&self, fired: &ScheduleEntry, id: Uuid) {
        let _gate = self.gate.lock().await;
        let result = match self.store.find(&fired.owner, fired.kind).await {
            Ok(Some(mut stored)) => {
                stored.last_job = Some(id);
                self.store.upsert(stored).await.map(|_| ())
            }
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(target = "fleet.scheduler", owner = %fired.owner, kind = %fired.kind, error = %err, "schedule_last_job_not_saved");
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(target = "fleet.scheduler", tick_secs = self.tick.as_secs(), "scheduler_started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick_at(Local::now()).await;
                    }
                }
            }
            info!(target = "fleet.scheduler", "scheduler_stopped");
        })
    }
}

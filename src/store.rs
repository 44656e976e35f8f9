//! Task record and schedule persistence.
//!
//! `create` is a conditional insert: it fails with `Conflict` while another
//! record of the same (owner, kind) is Running. The running slot is freed in
//! the same critical section that makes a record terminal, so the index can
//! never disagree with the records it points at.
//!
//! Schedule entries are upserted by (owner, kind), in memory or in a Redis
//! hash so they survive restarts.

use crate::models::{ItemResult, TaskKind, TaskRecord, TaskStatus};
use crate::scheduler::ScheduleEntry;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::fmt::Display;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("a {kind} job is already running ({existing})")]
    Conflict { kind: TaskKind, existing: Uuid },
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} already finished")]
    AlreadyTerminal(Uuid),
    #[error("task store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError>;
    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError>;
    async fn append_result(&self, id: Uuid, result: ItemResult) -> Result<(), StoreError>;
    async fn complete(&self, id: Uuid, results: Vec<ItemResult>)
    -> Result<TaskRecord, StoreError>;
    async fn fail(&self, id: Uuid, error: String) -> Result<TaskRecord, StoreError>;
    async fn get(&self, id: Uuid, owner: &str) -> Result<TaskRecord, StoreError>;
    async fn list(&self, owner: &str) -> Vec<TaskRecord>;
    async fn running(&self, owner: &str, kind: TaskKind) -> Option<Uuid>;
}

#[derive(Default)]
struct StoreState {
    records: HashMap<Uuid, TaskRecord>,
    running: HashMap<(String, TaskKind), Uuid>,
}

impl StoreState {
    fn running_mut(&mut self, id: Uuid) -> Result<&mut TaskRecord, StoreError> {
        let record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal(id));
        }
        Ok(record)
    }

    fn finish(
        &mut self,
        id: Uuid,
        status: TaskStatus,
        apply: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, StoreError> {
        let record = self.running_mut(id)?;
        let now = Utc::now();
        record.status = status;
        record.updated_at = now;
        record.completed_at = Some(now);
        apply(record);
        let snapshot = record.clone();
        let key = (snapshot.owner.clone(), snapshot.kind);
        if self.running.get(&key) == Some(&id) {
            self.running.remove(&key);
        }
        Ok(snapshot)
    }
}

#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<StoreState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = (record.owner.clone(), record.kind);
        if let Some(existing) = state.running.get(&key) {
            return Err(StoreError::Conflict {
                kind: record.kind,
                existing: *existing,
            });
        }
        state.running.insert(key, record.id);
        state.records.insert(record.id, record);
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.running_mut(id)?;
        record.progress = record.progress.max(progress.min(100));
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn append_result(&self, id: Uuid, result: ItemResult) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.running_mut(id)?;
        record.results.push(result);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        results: Vec<ItemResult>,
    ) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.finish(id, TaskStatus::Completed, |record| {
            record.progress = 100;
            record.results = results;
        })
    }

    async fn fail(&self, id: Uuid, error: String) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.finish(id, TaskStatus::Failed, |record| {
            record.error = Some(error);
        })
    }

    async fn get(&self, id: Uuid, owner: &str) -> Result<TaskRecord, StoreError> {
        let state = self.state.lock().await;
        state
            .records
            .get(&id)
            .filter(|record| record.owner == owner)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, owner: &str) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> = state
            .records
            .values()
            .filter(|record| record.owner == owner)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    async fn running(&self, owner: &str, kind: TaskKind) -> Option<Uuid> {
        let state = self.state.lock().await;
        state.running.get(&(owner.to_string(), kind)).copied()
    }
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Inserts or replaces the entry for its (owner, kind). Returns whether an
    /// entry was replaced.
    async fn upsert(&self, entry: ScheduleEntry) -> Result<bool, StoreError>;
    async fn remove(&self, owner: &str, kind: TaskKind) -> Result<bool, StoreError>;
    async fn find(&self, owner: &str, kind: TaskKind)
    -> Result<Option<ScheduleEntry>, StoreError>;
    async fn list(&self, owner: &str) -> Result<Vec<ScheduleEntry>, StoreError>;
    async fn all(&self) -> Result<Vec<ScheduleEntry>, StoreError>;
}

#[derive(Default)]
pub struct MemoryScheduleStore {
    entries: Mutex<HashMap<(String, TaskKind), ScheduleEntry>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert(&self, entry: ScheduleEntry) -> Result<bool, StoreError> {
        let key = (entry.owner.clone(), entry.kind);
        Ok(self.entries.lock().await.insert(key, entry).is_some())
    }

    async fn remove(&self, owner: &str, kind: TaskKind) -> Result<bool, StoreError> {
        let key = (owner.to_string(), kind);
        Ok(self.entries.lock().await.remove(&key).is_some())
    }

    async fn find(
        &self,
        owner: &str,
        kind: TaskKind,
    ) -> Result<Option<ScheduleEntry>, StoreError> {
        let key = (owner.to_string(), kind);
        Ok(self.entries.lock().await.get(&key).cloned())
    }

    async fn list(&self, owner: &str) -> Result<Vec<ScheduleEntry>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|entry| entry.owner == owner)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

const SCHEDULES_KEY: &str = "fleet:schedules";

/// Schedule entries as JSON values in one Redis hash, one field per
/// (owner, kind).
pub struct RedisScheduleStore {
    client: redis::Client,
}

impl RedisScheduleStore {
    pub fn new(redis_url: &str) -> eyre::Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }
}

fn schedule_field(owner: &str, kind: TaskKind) -> String {
    format!("{owner}/{kind}")
}

fn unavailable(err: impl Display) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn decode_entry(raw: &str) -> Option<ScheduleEntry> {
    match serde_json::from_str(raw) {
        Ok(entry) => Some(entry),
        Err(err) => {
            warn!(target = "fleet.scheduler", error = %err, "schedule_entry_unreadable");
            None
        }
    }
}

#[async_trait]
impl ScheduleStore for RedisScheduleStore {
    async fn upsert(&self, entry: ScheduleEntry) -> Result<bool, StoreError> {
        let raw = serde_json::to_string(&entry).map_err(unavailable)?;
        let mut conn = self.connection().await?;
        let added: i64 = conn
            .hset(SCHEDULES_KEY, schedule_field(&entry.owner, entry.kind), raw)
            .await
            .map_err(unavailable)?;
        Ok(added == 0)
    }

    async fn remove(&self, owner: &str, kind: TaskKind) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .hdel(SCHEDULES_KEY, schedule_field(owner, kind))
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn find(
        &self,
        owner: &str,
        kind: TaskKind,
    ) -> Result<Option<ScheduleEntry>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .hget(SCHEDULES_KEY, schedule_field(owner, kind))
            .await
            .map_err(unavailable)?;
        Ok(raw.as_deref().and_then(decode_entry))
    }

    async fn list(&self, owner: &str) -> Result<Vec<ScheduleEntry>, StoreError> {
        let mut entries = self.all().await?;
        entries.retain(|entry| entry.owner == owner);
        Ok(entries)
    }

    async fn all(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn.hvals(SCHEDULES_KEY).await.map_err(unavailable)?;
        Ok(values.iter().filter_map(|raw| decode_entry(raw)).collect())
    }
}

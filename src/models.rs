use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    DailyTasks,
    Polish,
    MidnightPolish,
    Publish,
    Ship,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::DailyTasks => "daily_tasks",
            TaskKind::Polish => "polish",
            TaskKind::MidnightPolish => "midnight_polish",
            TaskKind::Publish => "publish",
            TaskKind::Ship => "ship",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job kind `{0}`")]
pub struct UnknownTaskKind(pub String);

/// Accepts the snake_case wire names, case-insensitively, with `-` for `_`.
impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "daily_tasks" => Ok(TaskKind::DailyTasks),
            "polish" => Ok(TaskKind::Polish),
            "midnight_polish" => Ok(TaskKind::MidnightPolish),
            "publish" => Ok(TaskKind::Publish),
            "ship" => Ok(TaskKind::Ship),
            _ => Err(UnknownTaskKind(input.to_string())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Persisted metadata for one job invocation, as returned to polling clients.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub owner: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub total: usize,
    pub results: Vec<ItemResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn running(owner: &str, kind: TaskKind, total: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            kind,
            status: TaskStatus::Running,
            progress: 0,
            total,
            results: Vec::with_capacity(total),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
    LoginFailed,
    Timeout,
    ElementNotFound,
    Network,
    UnexpectedPage,
    QuotaExhausted,
    AlreadyPublished,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NotFound => "not_found",
            FailureReason::LoginFailed => "login_failed",
            FailureReason::Timeout => "timeout",
            FailureReason::ElementNotFound => "element_not_found",
            FailureReason::Network => "network",
            FailureReason::UnexpectedPage => "unexpected_page",
            FailureReason::QuotaExhausted => "quota_exhausted",
            FailureReason::AlreadyPublished => "already_published",
        }
    }

    /// Transient reasons that a retry policy is allowed to act on.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::Network)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        derived_id: Option<String>,
    },
    Failure {
        reason: FailureReason,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReport {
    pub name: String,
    pub success: bool,
    pub message: String,
}

impl StepReport {
    pub fn new(name: &str, success: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success,
            message: message.into(),
        }
    }
}

/// Outcome of one work item. Appended to a task in processing order and never
/// rewritten afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemResult {
    pub item_id: String,
    pub success: bool,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepReport>,
}

impl ItemResult {
    pub fn new(item_id: impl Into<String>, outcome: ItemOutcome) -> Self {
        Self {
            item_id: item_id.into(),
            success: matches!(outcome, ItemOutcome::Success { .. }),
            outcome,
            attempts: 1,
            steps: Vec::new(),
        }
    }

    pub fn succeeded(
        item_id: impl Into<String>,
        message: impl Into<String>,
        derived_id: Option<String>,
    ) -> Self {
        Self::new(
            item_id,
            ItemOutcome::Success {
                message: message.into(),
                derived_id,
            },
        )
    }

    pub fn failed(
        item_id: impl Into<String>,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            item_id,
            ItemOutcome::Failure {
                reason,
                message: message.into(),
            },
        )
    }

    pub fn with_steps(mut self, steps: Vec<StepReport>) -> Self {
        self.steps = steps;
        self
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.outcome {
            ItemOutcome::Failure { reason, .. } => Some(*reason),
            ItemOutcome::Success { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match &self.outcome {
            ItemOutcome::Success { message, .. } | ItemOutcome::Failure { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Beijing,
    Shanghai,
    Guangzhou,
    Shenzhen,
    Hangzhou,
    #[default]
    Random,
}

impl Region {
    pub fn label(&self) -> &'static str {
        match self {
            Region::Beijing => "北京",
            Region::Shanghai => "上海",
            Region::Guangzhou => "广州",
            Region::Shenzhen => "深圳",
            Region::Hangzhou => "杭州",
            Region::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Logistics {
    pub company: String,
    pub number: String,
}

/// Work description for one job, tagged by kind on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    DailyTasks,
    Polish {
        product_ids: Vec<String>,
    },
    MidnightPolish {
        product_ids: Vec<String>,
    },
    Publish {
        product_ids: Vec<String>,
        #[serde(default)]
        account_id: Option<String>,
        #[serde(default)]
        region: Region,
    },
    Ship {
        order_ids: Vec<String>,
        logistics_company: String,
        logistics_number: String,
    },
}

impl JobPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            JobPayload::DailyTasks => TaskKind::DailyTasks,
            JobPayload::Polish { .. } => TaskKind::Polish,
            JobPayload::MidnightPolish { .. } => TaskKind::MidnightPolish,
            JobPayload::Publish { .. } => TaskKind::Publish,
            JobPayload::Ship { .. } => TaskKind::Ship,
        }
    }
}

/// Bounded retry for transient per-item failures. `max_attempts` counts the
/// first try, so the default of 1 means no retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn clamped(self, ceiling: u32) -> Self {
        Self {
            max_attempts: self.max_attempts.clamp(1, ceiling.max(1)),
            backoff_ms: self.backoff_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct JobRequest {
    #[serde(flatten)]
    pub payload: JobPayload,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl From<JobPayload> for JobRequest {
    fn from(payload: JobPayload) -> Self {
        Self {
            payload,
            retry: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

//! Scheduled-task management.
//!
//! Cron-driven workflow starts live in two places: the external durable
//! scheduler (which owns firing and the authoritative next-run time) and a
//! relational catalog (the queryable source of user-facing state). This
//! module keeps the two synchronized: validated CRUD, inline rollback when
//! persistence fails after an external create, and orphan reconciliation
//! for rows whose external schedule vanished.

pub mod cron;
pub mod manager;

pub use cron::{CronExpression, CronParser};
pub use manager::{CreateScheduleInput, ScheduleManager, ScheduleManagerConfig, UpdateScheduleInput};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::EngineError;

/// Schedule lifecycle state. `Deleted` is terminal (soft delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Deleted,
}

impl ScheduleStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Deleted => "DELETED",
        }
    }

    /// Parse from the catalog's string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// A scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule ID.
    pub id: String,
    /// User who owns this schedule.
    pub user_id: String,
    /// Tenant for multi-tenant deployments.
    pub tenant_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Cron expression (5-field standard).
    pub cron_expression: String,
    /// IANA timezone the cron is evaluated in.
    pub timezone: String,
    /// Task query submitted on every fire.
    pub task_query: String,
    /// Extra task context replayed on every fire.
    pub task_context: serde_json::Value,
    /// Budget cap per run, USD.
    pub max_budget_per_run_usd: f64,
    /// Run timeout in seconds.
    pub timeout_seconds: u64,
    /// Id of the mirrored external schedule.
    pub external_schedule_id: String,
    /// Lifecycle state.
    pub status: ScheduleStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Cached copy of the external scheduler's authoritative next-run time.
    pub next_run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
}

/// One recorded execution of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub schedule_id: String,
    pub task_id: String,
    pub status: String,
    pub total_cost_usd: f64,
    pub error_message: Option<String>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Scheduler error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("cron interval too short: consecutive fires must be at least {min_minutes} minutes apart")]
    IntervalTooShort { min_minutes: u32 },
    #[error("schedule quota reached: at most {max} schedules per user")]
    QuotaReached { max: usize },
    #[error("budget {budget} exceeds the per-run limit of {max} USD")]
    BudgetExceeded { budget: f64, max: f64 },
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("schedule not found: {0}")]
    NotFound(String),
    #[error("external scheduler unavailable: {0}")]
    Unavailable(String),
    #[error("external scheduler error: {0}")]
    Engine(EngineError),
    #[error("schedule catalog error: {0}")]
    Catalog(String),
}

impl ScheduleError {
    /// True for caller-fixable validation failures (HTTP 400).
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidCron(_)
                | Self::IntervalTooShort { .. }
                | Self::QuotaReached { .. }
                | Self::BudgetExceeded { .. }
                | Self::InvalidTimezone(_)
        )
    }
}

impl From<crate::breaker::BreakerError<EngineError>> for ScheduleError {
    fn from(err: crate::breaker::BreakerError<EngineError>) -> Self {
        match err {
            crate::breaker::BreakerError::Inner(EngineError::NotFound(id)) => Self::NotFound(id),
            crate::breaker::BreakerError::Inner(inner) => Self::Engine(inner),
            rejection => Self::Unavailable(rejection.to_string()),
        }
    }
}

/// Relational catalog operations behind the schedule manager.
///
/// Implementations: the PostgreSQL catalog in the database module and
/// [`MemoryScheduleCatalog`] for tests and embedded runs.
#[async_trait]
pub trait ScheduleCatalog: Send + Sync {
    async fn insert(&self, schedule: &Schedule) -> anyhow::Result<()>;

    async fn update(&self, schedule: &Schedule) -> anyhow::Result<()>;

    async fn get(&self, id: &str) -> anyhow::Result<Option<Schedule>>;

    async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<ScheduleStatus>,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Schedule>>;

    /// Count of a user's non-deleted schedules, for quota enforcement.
    async fn count_for_user(&self, user_id: &str) -> anyhow::Result<usize>;

    async fn record_execution(&self, execution: &ScheduleExecution) -> anyhow::Result<()>;
}

/// In-memory catalog used by tests and Redis-less embedded runs.
#[derive(Debug, Default)]
pub struct MemoryScheduleCatalog {
    schedules: Mutex<Vec<Schedule>>,
    executions: Mutex<Vec<ScheduleExecution>>,
    /// When set, the next `insert` fails once. Lets tests exercise the
    /// create-rollback path.
    fail_next_insert: Mutex<bool>,
}

impl MemoryScheduleCatalog {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arrange for the next insert to fail.
    pub fn fail_next_insert(&self) {
        *self.fail_next_insert.lock() = true;
    }

    /// Snapshot of recorded executions.
    #[must_use]
    pub fn executions(&self) -> Vec<ScheduleExecution> {
        self.executions.lock().clone()
    }
}

#[async_trait]
impl ScheduleCatalog for MemoryScheduleCatalog {
    async fn insert(&self, schedule: &Schedule) -> anyhow::Result<()> {
        if std::mem::take(&mut *self.fail_next_insert.lock()) {
            anyhow::bail!("injected insert failure");
        }
        self.schedules.lock().push(schedule.clone());
        Ok(())
    }

    async fn update(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let mut schedules = self.schedules.lock();
        match schedules.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(())
            }
            None => anyhow::bail!("schedule {} not in catalog", schedule.id),
        }
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Schedule>> {
        Ok(self.schedules.lock().iter().find(|s| s.id == id).cloned())
    }

    async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<ScheduleStatus>,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Schedule>> {
        Ok(self
            .schedules
            .lock()
            .iter()
            .filter(|s| user_id.is_none_or(|u| s.user_id == u))
            .filter(|s| status.is_none_or(|st| s.status == st))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_for_user(&self, user_id: &str) -> anyhow::Result<usize> {
        Ok(self
            .schedules
            .lock()
            .iter()
            .filter(|s| s.user_id == user_id && s.status != ScheduleStatus::Deleted)
            .count())
    }

    async fn record_execution(&self, execution: &ScheduleExecution) -> anyhow::Result<()> {
        self.executions.lock().push(execution.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ScheduleStatus::Active,
            ScheduleStatus::Paused,
            ScheduleStatus::Deleted,
        ] {
            assert_eq!(ScheduleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ScheduleStatus::parse("bogus"), None);
    }

    #[test]
    fn test_validation_classification() {
        assert!(ScheduleError::InvalidCron("x".into()).is_validation());
        assert!(ScheduleError::QuotaReached { max: 50 }.is_validation());
        assert!(!ScheduleError::NotFound("id".into()).is_validation());
        assert!(!ScheduleError::Unavailable("open".into()).is_validation());
    }
}

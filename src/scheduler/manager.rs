//! Schedule manager: validated CRUD synchronized with the external
//! scheduler.
//!
//! The external scheduler owns firing and the authoritative next-run time;
//! the relational catalog owns user-visible state. Every external call goes
//! through the gRPC circuit breaker. Methods are reentrant; the product
//! never drives the same schedule concurrently, so there is no per-schedule
//! locking here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use serde_json::json;

use super::{
    CronExpression, CronParser, Schedule, ScheduleCatalog, ScheduleError, ScheduleExecution,
    ScheduleStatus,
};
use crate::breaker::grpc::GrpcBreaker;
use crate::engine::{
    CreateScheduleRequest, ScheduleAction, ScheduleClient, ScheduleSpec,
};
use crate::metrics;

/// Manager policy knobs.
#[derive(Debug, Clone)]
pub struct ScheduleManagerConfig {
    /// Minimum gap between two consecutive fires, in minutes.
    pub min_cron_interval_mins: u32,
    /// Maximum non-deleted schedules per user.
    pub max_per_user: usize,
    /// Upper bound on the per-run budget, USD.
    pub max_budget_per_run_usd: f64,
    /// Workflow type started on every fire.
    pub workflow_type: String,
    /// Task queue the workflow runs on.
    pub task_queue: String,
    /// Default run timeout when the schedule does not set one.
    pub default_timeout_seconds: u64,
}

impl Default for ScheduleManagerConfig {
    fn default() -> Self {
        Self {
            min_cron_interval_mins: 60,
            max_per_user: 50,
            max_budget_per_run_usd: 10.0,
            workflow_type: "ScheduledTaskWorkflow".to_string(),
            task_queue: "shannon-tasks".to_string(),
            default_timeout_seconds: 1800,
        }
    }
}

/// Input for creating a schedule.
#[derive(Debug, Clone)]
pub struct CreateScheduleInput {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    /// IANA timezone; empty means UTC.
    pub timezone: Option<String>,
    pub task_query: String,
    pub task_context: Option<serde_json::Value>,
    pub max_budget_per_run_usd: Option<f64>,
    pub timeout_seconds: Option<u64>,
}

/// Partial update. `None` fields are preserved. For `task_context`,
/// `Some(null)` also preserves while `Some({})` clears.
#[derive(Debug, Clone, Default)]
pub struct UpdateScheduleInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub task_query: Option<String>,
    pub task_context: Option<serde_json::Value>,
    pub max_budget_per_run_usd: Option<f64>,
    pub timeout_seconds: Option<u64>,
}

/// Cron-driven schedule CRUD over the external scheduler and the catalog.
pub struct ScheduleManager {
    client: Arc<dyn ScheduleClient>,
    catalog: Arc<dyn ScheduleCatalog>,
    breaker: GrpcBreaker,
    config: ScheduleManagerConfig,
}

impl ScheduleManager {
    #[must_use]
    pub fn new(
        client: Arc<dyn ScheduleClient>,
        catalog: Arc<dyn ScheduleCatalog>,
        breaker: GrpcBreaker,
        config: ScheduleManagerConfig,
    ) -> Self {
        Self {
            client,
            catalog,
            breaker,
            config,
        }
    }

    /// Create a schedule: validate, create the external schedule, persist
    /// the row. If persistence fails the external schedule is deleted
    /// inline so no orphan survives the failure.
    pub async fn create(&self, input: CreateScheduleInput) -> Result<Schedule, ScheduleError> {
        let cron = parse_cron(&input.cron_expression)?;
        let tz = parse_timezone(input.timezone.as_deref())?;
        self.check_interval(&cron, tz)?;

        let owned = self
            .catalog
            .count_for_user(&input.user_id)
            .await
            .map_err(|e| ScheduleError::Catalog(e.to_string()))?;
        if owned >= self.config.max_per_user {
            return Err(ScheduleError::QuotaReached {
                max: self.config.max_per_user,
            });
        }

        let budget = input
            .max_budget_per_run_usd
            .unwrap_or(self.config.max_budget_per_run_usd);
        if !(0.0..=self.config.max_budget_per_run_usd).contains(&budget) {
            return Err(ScheduleError::BudgetExceeded {
                budget,
                max: self.config.max_budget_per_run_usd,
            });
        }

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let external_schedule_id = format!("schedule-{id}");
        let timeout_seconds = input
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds);
        let task_context = input
            .task_context
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

        let schedule = Schedule {
            id: id.clone(),
            user_id: input.user_id.clone(),
            tenant_id: input.tenant_id.clone(),
            name: input.name,
            description: input.description,
            cron_expression: input.cron_expression.clone(),
            timezone: tz.name().to_string(),
            task_query: input.task_query.clone(),
            task_context,
            max_budget_per_run_usd: budget,
            timeout_seconds,
            external_schedule_id: external_schedule_id.clone(),
            status: ScheduleStatus::Active,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: cron
                .next_after(&now.with_timezone(&tz))
                .map(|t| t.with_timezone(&Utc)),
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
        };

        let mut memo = HashMap::new();
        memo.insert("schedule_id".to_string(), id.clone());
        memo.insert("user_id".to_string(), input.user_id);
        if let Some(tenant_id) = input.tenant_id {
            memo.insert("tenant_id".to_string(), tenant_id);
        }

        let request = CreateScheduleRequest {
            schedule_id: external_schedule_id.clone(),
            spec: self.spec_for(&schedule),
            action: self.action_for(&schedule),
            memo,
            paused: false,
        };
        let client = Arc::clone(&self.client);
        self.breaker
            .execute(|| async move { client.create(request).await })
            .await
            .inspect_err(|_| metrics::inc_schedule_op("create", "error"))?;

        if let Err(e) = self.catalog.insert(&schedule).await {
            // Roll back: the external schedule must not outlive the row.
            tracing::error!(
                schedule_id = %id,
                error = %e,
                "Schedule persistence failed; deleting external schedule"
            );
            let client = Arc::clone(&self.client);
            let external = external_schedule_id.clone();
            if let Err(delete_err) = self
                .breaker
                .execute(|| async move { client.delete(&external).await })
                .await
            {
                tracing::error!(
                    schedule_id = %id,
                    external_schedule_id = %external_schedule_id,
                    error = %delete_err,
                    "Rollback delete of external schedule failed"
                );
            }
            metrics::inc_schedule_op("create", "error");
            return Err(ScheduleError::Catalog(e.to_string()));
        }

        metrics::inc_schedule_op("create", "ok");
        tracing::info!(
            schedule_id = %id,
            cron = %schedule.cron_expression,
            timezone = %schedule.timezone,
            "Schedule created"
        );
        Ok(schedule)
    }

    /// Pause a schedule. Idempotent.
    pub async fn pause(&self, id: &str, reason: &str) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.get_live(id).await?;
        if schedule.status == ScheduleStatus::Paused {
            return Ok(schedule);
        }

        let client = Arc::clone(&self.client);
        let external = schedule.external_schedule_id.clone();
        let note = reason.to_string();
        self.breaker
            .execute(|| async move { client.pause(&external, &note).await })
            .await?;

        schedule.status = ScheduleStatus::Paused;
        schedule.updated_at = Utc::now();
        self.persist(&schedule, "pause").await?;
        Ok(schedule)
    }

    /// Resume a paused schedule, refreshing `next_run_at` from cron.
    /// Idempotent.
    pub async fn resume(&self, id: &str, reason: &str) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.get_live(id).await?;
        if schedule.status == ScheduleStatus::Active {
            return Ok(schedule);
        }

        let client = Arc::clone(&self.client);
        let external = schedule.external_schedule_id.clone();
        let note = reason.to_string();
        self.breaker
            .execute(|| async move { client.unpause(&external, &note).await })
            .await?;

        schedule.status = ScheduleStatus::Active;
        schedule.updated_at = Utc::now();
        schedule.next_run_at = self.local_next_run(&schedule);
        self.persist(&schedule, "resume").await?;
        Ok(schedule)
    }

    /// Delete a schedule: remove the external schedule (tolerating one that
    /// is already gone) and soft-delete the row.
    pub async fn delete(&self, id: &str) -> Result<(), ScheduleError> {
        let mut schedule = self.get_live(id).await?;

        let client = Arc::clone(&self.client);
        let external = schedule.external_schedule_id.clone();
        match self
            .breaker
            .execute(|| async move { client.delete(&external).await })
            .await
        {
            Ok(()) | Err(crate::breaker::BreakerError::Inner(crate::engine::EngineError::NotFound(_))) => {}
            Err(e) => return Err(e.into()),
        }

        schedule.status = ScheduleStatus::Deleted;
        schedule.updated_at = Utc::now();
        self.persist(&schedule, "delete").await?;
        tracing::info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    /// Partially update a schedule. Spec- or action-affecting changes are
    /// pushed to the external scheduler with describe-and-modify semantics;
    /// `next_run_at` is then refreshed from the scheduler's authoritative
    /// next-action time, falling back to local cron evaluation.
    pub async fn update(
        &self,
        id: &str,
        patch: UpdateScheduleInput,
    ) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.get_live(id).await?;

        if let Some(name) = patch.name {
            schedule.name = name;
        }
        if let Some(description) = patch.description {
            schedule.description = Some(description);
        }

        let mut spec_changed = false;
        if let Some(cron_expression) = patch.cron_expression {
            let cron = parse_cron(&cron_expression)?;
            let tz = parse_timezone(Some(
                patch.timezone.as_deref().unwrap_or(&schedule.timezone),
            ))?;
            self.check_interval(&cron, tz)?;
            schedule.cron_expression = cron_expression;
            spec_changed = true;
        }
        if let Some(timezone) = patch.timezone {
            let tz = parse_timezone(Some(&timezone))?;
            if schedule.timezone != tz.name() {
                // Re-check the interval under the new timezone.
                let cron = parse_cron(&schedule.cron_expression)?;
                self.check_interval(&cron, tz)?;
                schedule.timezone = tz.name().to_string();
                spec_changed = true;
            }
        }

        let mut action_changed = false;
        if let Some(task_query) = patch.task_query {
            schedule.task_query = task_query;
            action_changed = true;
        }
        match patch.task_context {
            // null preserves the stored context, an explicit {} clears it.
            None | Some(serde_json::Value::Null) => {}
            Some(context) => {
                schedule.task_context = context;
                action_changed = true;
            }
        }
        if let Some(budget) = patch.max_budget_per_run_usd {
            if !(0.0..=self.config.max_budget_per_run_usd).contains(&budget) {
                return Err(ScheduleError::BudgetExceeded {
                    budget,
                    max: self.config.max_budget_per_run_usd,
                });
            }
            schedule.max_budget_per_run_usd = budget;
            action_changed = true;
        }
        if let Some(timeout_seconds) = patch.timeout_seconds {
            schedule.timeout_seconds = timeout_seconds;
            action_changed = true;
        }

        if spec_changed || action_changed {
            let client = Arc::clone(&self.client);
            let external = schedule.external_schedule_id.clone();
            let spec = self.spec_for(&schedule);
            let action = self.action_for(&schedule);
            self.breaker
                .execute(|| async move { client.update(&external, spec, action).await })
                .await?;

            schedule.next_run_at = self.external_next_run(&schedule).await;
        }

        schedule.updated_at = Utc::now();
        self.persist(&schedule, "update").await?;
        Ok(schedule)
    }

    /// Fetch a schedule by id, including soft-deleted rows.
    pub async fn get(&self, id: &str) -> Result<Schedule, ScheduleError> {
        self.catalog
            .get(id)
            .await
            .map_err(|e| ScheduleError::Catalog(e.to_string()))?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    /// List schedules with pagination and an optional status filter.
    pub async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<ScheduleStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Schedule>, ScheduleError> {
        self.catalog
            .list(user_id, status, limit.clamp(1, 500), offset)
            .await
            .map_err(|e| ScheduleError::Catalog(e.to_string()))
    }

    /// Record one execution outcome reported by a worker.
    pub async fn record_execution(
        &self,
        execution: ScheduleExecution,
    ) -> Result<(), ScheduleError> {
        let mut schedule = self.get(&execution.schedule_id).await?;
        schedule.total_runs += 1;
        if execution.status == "COMPLETED" {
            schedule.successful_runs += 1;
        } else {
            schedule.failed_runs += 1;
        }
        schedule.last_run_at = Some(execution.completed_at);
        schedule.updated_at = Utc::now();

        self.catalog
            .record_execution(&execution)
            .await
            .map_err(|e| ScheduleError::Catalog(e.to_string()))?;
        self.persist(&schedule, "record_execution").await?;
        Ok(())
    }

    /// Verify the external schedule behind a row still exists. A NOT_FOUND
    /// answer marks the row deleted (orphan). Returns whether it exists.
    pub async fn verify_schedule_exists(
        &self,
        schedule: &Schedule,
    ) -> Result<bool, ScheduleError> {
        let client = Arc::clone(&self.client);
        let external = schedule.external_schedule_id.clone();
        match self
            .breaker
            .execute(|| async move { client.describe(&external).await })
            .await
        {
            Ok(_) => Ok(true),
            Err(crate::breaker::BreakerError::Inner(crate::engine::EngineError::NotFound(_))) => {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    external_schedule_id = %schedule.external_schedule_id,
                    "External schedule missing; marking row deleted"
                );
                let mut orphan = schedule.clone();
                orphan.status = ScheduleStatus::Deleted;
                orphan.updated_at = Utc::now();
                self.persist(&orphan, "orphan_cleanup").await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sweep ACTIVE/PAUSED rows and reconcile those whose external schedule
    /// vanished. Returns the number of orphans cleaned.
    pub async fn detect_and_clean_orphaned_schedules(&self) -> Result<usize, ScheduleError> {
        let mut cleaned = 0;
        for status in [ScheduleStatus::Active, ScheduleStatus::Paused] {
            let mut offset = 0;
            loop {
                let page = self.list(None, Some(status), 100, offset).await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                for schedule in &page {
                    if !self.verify_schedule_exists(schedule).await? {
                        cleaned += 1;
                    }
                }
            }
        }
        if cleaned > 0 {
            tracing::info!(cleaned, "Orphaned schedules reconciled");
        }
        Ok(cleaned)
    }

    fn spec_for(&self, schedule: &Schedule) -> ScheduleSpec {
        ScheduleSpec {
            cron: schedule.cron_expression.clone(),
            timezone: schedule.timezone.clone(),
        }
    }

    fn action_for(&self, schedule: &Schedule) -> ScheduleAction {
        ScheduleAction {
            workflow_type: self.config.workflow_type.clone(),
            task_queue: self.config.task_queue.clone(),
            input: json!({
                "query": schedule.task_query,
                "context": schedule.task_context,
                "max_budget_per_run_usd": schedule.max_budget_per_run_usd,
                "timeout_seconds": schedule.timeout_seconds,
            }),
            run_timeout: Duration::from_secs(schedule.timeout_seconds),
        }
    }

    fn check_interval(&self, cron: &CronExpression, tz: Tz) -> Result<(), ScheduleError> {
        let min_minutes = self.config.min_cron_interval_mins;
        if min_minutes == 0 {
            return Ok(());
        }
        let now = Utc::now().with_timezone(&tz);
        let interval = cron
            .fire_interval(&now)
            .ok_or_else(|| ScheduleError::InvalidCron("expression never fires".to_string()))?;
        if interval < chrono::Duration::minutes(i64::from(min_minutes)) {
            return Err(ScheduleError::IntervalTooShort { min_minutes });
        }
        Ok(())
    }

    /// Next fire computed locally from the stored cron and timezone.
    fn local_next_run(&self, schedule: &Schedule) -> Option<chrono::DateTime<Utc>> {
        let cron = CronParser::parse(&schedule.cron_expression).ok()?;
        let tz: Tz = schedule.timezone.parse().ok()?;
        cron.next_after(&Utc::now().with_timezone(&tz))
            .map(|t| t.with_timezone(&Utc))
    }

    /// Next fire per the external scheduler, falling back to local cron
    /// evaluation when the describe fails.
    async fn external_next_run(&self, schedule: &Schedule) -> Option<chrono::DateTime<Utc>> {
        let client = Arc::clone(&self.client);
        let external = schedule.external_schedule_id.clone();
        match self
            .breaker
            .execute(|| async move { client.describe(&external).await })
            .await
        {
            Ok(description) => description
                .next_action_time
                .or_else(|| self.local_next_run(schedule)),
            Err(e) => {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    error = %e,
                    "Describe failed; next_run_at computed locally"
                );
                self.local_next_run(schedule)
            }
        }
    }

    async fn get_live(&self, id: &str) -> Result<Schedule, ScheduleError> {
        let schedule = self.get(id).await?;
        if schedule.status == ScheduleStatus::Deleted {
            return Err(ScheduleError::NotFound(id.to_string()));
        }
        Ok(schedule)
    }

    async fn persist(&self, schedule: &Schedule, operation: &str) -> Result<(), ScheduleError> {
        self.catalog.update(schedule).await.map_err(|e| {
            metrics::inc_schedule_op(operation, "error");
            ScheduleError::Catalog(e.to_string())
        })?;
        metrics::inc_schedule_op(operation, "ok");
        Ok(())
    }
}

impl std::fmt::Debug for ScheduleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn parse_cron(expression: &str) -> Result<CronExpression, ScheduleError> {
    CronParser::parse(expression).map_err(|e| ScheduleError::InvalidCron(e.to_string()))
}

fn parse_timezone(timezone: Option<&str>) -> Result<Tz, ScheduleError> {
    match timezone {
        None | Some("") => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(name.to_string())),
    }
}

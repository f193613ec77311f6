//! PostgreSQL schedule catalog.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::breaker::sql::SqlBreaker;
use crate::scheduler::{Schedule, ScheduleCatalog, ScheduleExecution, ScheduleStatus};

/// Relational mirror of schedules in `scheduled_tasks` plus the
/// per-run ledger in `scheduled_task_executions`.
#[derive(Debug, Clone)]
pub struct PgScheduleCatalog {
    pool: PgPool,
    breaker: SqlBreaker,
}

impl PgScheduleCatalog {
    #[must_use]
    pub fn new(pool: PgPool, breaker: SqlBreaker) -> Self {
        Self { pool, breaker }
    }
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status = ScheduleStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: format!("unknown schedule status {status_raw:?}").into(),
    })?;
    let timeout_seconds: i64 = row.try_get("timeout_seconds")?;

    Ok(Schedule {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        cron_expression: row.try_get("cron_expression")?,
        timezone: row.try_get("timezone")?,
        task_query: row.try_get("task_query")?,
        task_context: row.try_get("task_context")?,
        max_budget_per_run_usd: row.try_get("max_budget_per_run_usd")?,
        timeout_seconds: u64::try_from(timeout_seconds).unwrap_or(0),
        external_schedule_id: row.try_get("external_schedule_id")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
        total_runs: row.try_get("total_runs")?,
        successful_runs: row.try_get("successful_runs")?,
        failed_runs: row.try_get("failed_runs")?,
    })
}

#[async_trait]
impl ScheduleCatalog for PgScheduleCatalog {
    async fn insert(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let pool = self.pool.clone();
        let s = schedule.clone();
        self.breaker
            .execute(|| async move {
                sqlx::query(
                    "INSERT INTO scheduled_tasks \
                     (id, user_id, tenant_id, name, description, cron_expression, timezone, \
                      task_query, task_context, max_budget_per_run_usd, timeout_seconds, \
                      external_schedule_id, status, created_at, updated_at, last_run_at, \
                      next_run_at, total_runs, successful_runs, failed_runs) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                             $16, $17, $18, $19, $20)",
                )
                .bind(&s.id)
                .bind(&s.user_id)
                .bind(&s.tenant_id)
                .bind(&s.name)
                .bind(&s.description)
                .bind(&s.cron_expression)
                .bind(&s.timezone)
                .bind(&s.task_query)
                .bind(&s.task_context)
                .bind(s.max_budget_per_run_usd)
                .bind(i64::try_from(s.timeout_seconds).unwrap_or(i64::MAX))
                .bind(&s.external_schedule_id)
                .bind(s.status.as_str())
                .bind(s.created_at)
                .bind(s.updated_at)
                .bind(s.last_run_at)
                .bind(s.next_run_at)
                .bind(s.total_runs)
                .bind(s.successful_runs)
                .bind(s.failed_runs)
                .execute(&pool)
                .await
                .map(|_| ())
            })
            .await?;
        Ok(())
    }

    async fn update(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let pool = self.pool.clone();
        let s = schedule.clone();
        let result = self
            .breaker
            .execute(|| async move {
                sqlx::query(
                    "UPDATE scheduled_tasks SET \
                     name = $2, description = $3, cron_expression = $4, timezone = $5, \
                     task_query = $6, task_context = $7, max_budget_per_run_usd = $8, \
                     timeout_seconds = $9, status = $10, updated_at = $11, last_run_at = $12, \
                     next_run_at = $13, total_runs = $14, successful_runs = $15, \
                     failed_runs = $16 \
                     WHERE id = $1",
                )
                .bind(&s.id)
                .bind(&s.name)
                .bind(&s.description)
                .bind(&s.cron_expression)
                .bind(&s.timezone)
                .bind(&s.task_query)
                .bind(&s.task_context)
                .bind(s.max_budget_per_run_usd)
                .bind(i64::try_from(s.timeout_seconds).unwrap_or(i64::MAX))
                .bind(s.status.as_str())
                .bind(s.updated_at)
                .bind(s.last_run_at)
                .bind(s.next_run_at)
                .bind(s.total_runs)
                .bind(s.successful_runs)
                .bind(s.failed_runs)
                .execute(&pool)
                .await
            })
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("schedule {} not in catalog", schedule.id);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Schedule>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let row = self
            .breaker
            .execute(|| async move {
                sqlx::query("SELECT * FROM scheduled_tasks WHERE id = $1")
                    .bind(&id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;
        row.as_ref().map(schedule_from_row).transpose().map_err(Into::into)
    }

    async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<ScheduleStatus>,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Schedule>> {
        let pool = self.pool.clone();
        let user_id = user_id.map(ToString::to_string);
        let status = status.map(|s| s.as_str().to_string());
        let rows = self
            .breaker
            .execute(|| async move {
                sqlx::query(
                    "SELECT * FROM scheduled_tasks \
                     WHERE ($1::text IS NULL OR user_id = $1) \
                       AND ($2::text IS NULL OR status = $2) \
                     ORDER BY created_at DESC \
                     LIMIT $3 OFFSET $4",
                )
                .bind(&user_id)
                .bind(&status)
                .bind(i64::try_from(limit).unwrap_or(100))
                .bind(i64::try_from(offset).unwrap_or(0))
                .fetch_all(&pool)
                .await
            })
            .await?;
        rows.iter()
            .map(schedule_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn count_for_user(&self, user_id: &str) -> anyhow::Result<usize> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();
        let count: i64 = self
            .breaker
            .execute(|| async move {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM scheduled_tasks \
                     WHERE user_id = $1 AND status <> 'DELETED'",
                )
                .bind(&user_id)
                .fetch_one(&pool)
                .await
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn record_execution(&self, execution: &ScheduleExecution) -> anyhow::Result<()> {
        let pool = self.pool.clone();
        let e = execution.clone();
        self.breaker
            .execute(|| async move {
                sqlx::query(
                    "INSERT INTO scheduled_task_executions \
                     (schedule_id, task_id, status, total_cost_usd, error_message, completed_at) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&e.schedule_id)
                .bind(&e.task_id)
                .bind(&e.status)
                .bind(e.total_cost_usd)
                .bind(&e.error_message)
                .bind(e.completed_at)
                .execute(&pool)
                .await
                .map(|_| ())
            })
            .await?;
        Ok(())
    }
}

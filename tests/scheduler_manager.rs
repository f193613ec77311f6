//! End-to-end tests for the scheduled-task manager against the fake
//! external scheduler and the in-memory catalog: validation, rollback,
//! lifecycle mirroring and orphan reconciliation.

mod common;

use std::sync::Arc;

use common::{grpc_breaker, FakeEngine};
use shannon_streaming::engine::ScheduleClient;
use shannon_streaming::scheduler::{
    CreateScheduleInput, MemoryScheduleCatalog, ScheduleError, ScheduleExecution, ScheduleManager,
    ScheduleManagerConfig, ScheduleStatus, UpdateScheduleInput,
};

fn create_input(user_id: &str) -> CreateScheduleInput {
    CreateScheduleInput {
        user_id: user_id.to_string(),
        tenant_id: Some("tenant-1".to_string()),
        name: "nightly report".to_string(),
        description: None,
        cron_expression: "0 3 * * *".to_string(),
        timezone: None,
        task_query: "summarize yesterday".to_string(),
        task_context: None,
        max_budget_per_run_usd: Some(2.5),
        timeout_seconds: Some(600),
    }
}

struct Fixture {
    manager: ScheduleManager,
    engine: Arc<FakeEngine>,
    catalog: Arc<MemoryScheduleCatalog>,
}

fn fixture() -> Fixture {
    let engine = FakeEngine::new();
    let catalog = MemoryScheduleCatalog::new();
    let manager = ScheduleManager::new(
        Arc::clone(&engine) as Arc<dyn ScheduleClient>,
        Arc::clone(&catalog) as _,
        grpc_breaker(),
        ScheduleManagerConfig::default(),
    );
    Fixture {
        manager,
        engine,
        catalog,
    }
}

#[tokio::test]
async fn test_create_sets_external_id_and_next_run() {
    let f = fixture();
    let schedule = f.manager.create(create_input("user-1")).await.unwrap();

    assert_eq!(schedule.external_schedule_id, format!("schedule-{}", schedule.id));
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert_eq!(schedule.timezone, "UTC");
    assert!(schedule.next_run_at.unwrap() > chrono::Utc::now());
    assert_eq!(
        f.engine.external_schedule_ids(),
        vec![schedule.external_schedule_id.clone()]
    );
}

#[tokio::test]
async fn test_create_validation_errors() {
    let f = fixture();

    let mut bad_cron = create_input("user-1");
    bad_cron.cron_expression = "not a cron".to_string();
    assert!(matches!(
        f.manager.create(bad_cron).await,
        Err(ScheduleError::InvalidCron(_))
    ));

    let mut too_frequent = create_input("user-1");
    too_frequent.cron_expression = "*/5 * * * *".to_string();
    assert!(matches!(
        f.manager.create(too_frequent).await,
        Err(ScheduleError::IntervalTooShort { min_minutes: 60 })
    ));

    let mut bad_tz = create_input("user-1");
    bad_tz.timezone = Some("Mars/Olympus_Mons".to_string());
    assert!(matches!(
        f.manager.create(bad_tz).await,
        Err(ScheduleError::InvalidTimezone(_))
    ));

    let mut over_budget = create_input("user-1");
    over_budget.max_budget_per_run_usd = Some(25.0);
    assert!(matches!(
        f.manager.create(over_budget).await,
        Err(ScheduleError::BudgetExceeded { .. })
    ));

    // Nothing leaked to the external scheduler.
    assert!(f.engine.external_schedule_ids().is_empty());
}

#[tokio::test]
async fn test_create_quota() {
    let engine = FakeEngine::new();
    let catalog = MemoryScheduleCatalog::new();
    let manager = ScheduleManager::new(
        Arc::clone(&engine) as Arc<dyn ScheduleClient>,
        Arc::clone(&catalog) as _,
        grpc_breaker(),
        ScheduleManagerConfig {
            max_per_user: 2,
            ..ScheduleManagerConfig::default()
        },
    );

    manager.create(create_input("user-1")).await.unwrap();
    manager.create(create_input("user-1")).await.unwrap();
    assert!(matches!(
        manager.create(create_input("user-1")).await,
        Err(ScheduleError::QuotaReached { max: 2 })
    ));

    // Other users are unaffected.
    manager.create(create_input("user-2")).await.unwrap();
}

#[tokio::test]
async fn test_create_rolls_back_external_schedule_on_persist_failure() {
    let f = fixture();
    f.catalog.fail_next_insert();

    let result = f.manager.create(create_input("user-1")).await;
    assert!(matches!(result, Err(ScheduleError::Catalog(_))));

    // The external schedule was deleted inline, so the orphan sweep has
    // nothing to do.
    assert!(f.engine.external_schedule_ids().is_empty());
    let cleaned = f.manager.detect_and_clean_orphaned_schedules().await.unwrap();
    assert_eq!(cleaned, 0);
}

#[tokio::test]
async fn test_pause_resume_mirror_external_state() {
    let f = fixture();
    let schedule = f.manager.create(create_input("user-1")).await.unwrap();

    let paused = f.manager.pause(&schedule.id, "maintenance").await.unwrap();
    assert_eq!(paused.status, ScheduleStatus::Paused);
    assert!(f.engine.paused.lock().contains(&schedule.external_schedule_id));

    // Idempotent.
    let paused_again = f.manager.pause(&schedule.id, "again").await.unwrap();
    assert_eq!(paused_again.status, ScheduleStatus::Paused);

    let resumed = f.manager.resume(&schedule.id, "done").await.unwrap();
    assert_eq!(resumed.status, ScheduleStatus::Active);
    assert!(!f.engine.paused.lock().contains(&schedule.external_schedule_id));
    assert!(resumed.next_run_at.unwrap() > chrono::Utc::now());
}

#[tokio::test]
async fn test_delete_is_soft_and_tolerates_missing_external() {
    let f = fixture();
    let schedule = f.manager.create(create_input("user-1")).await.unwrap();

    // External schedule vanished out of band.
    f.engine.schedules.lock().clear();

    f.manager.delete(&schedule.id).await.unwrap();
    let row = f.manager.get(&schedule.id).await.unwrap();
    assert_eq!(row.status, ScheduleStatus::Deleted);

    // Deleted is terminal.
    assert!(matches!(
        f.manager.pause(&schedule.id, "x").await,
        Err(ScheduleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_update_rewrites_spec_and_refreshes_next_run() {
    let f = fixture();
    let schedule = f.manager.create(create_input("user-1")).await.unwrap();

    let authoritative = chrono::Utc::now() + chrono::Duration::hours(7);
    *f.engine.next_action_time.lock() = Some(authoritative);

    let updated = f
        .manager
        .update(
            &schedule.id,
            UpdateScheduleInput {
                cron_expression: Some("0 */6 * * *".to_string()),
                task_query: Some("new query".to_string()),
                ..UpdateScheduleInput::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.cron_expression, "0 */6 * * *");
    assert_eq!(updated.task_query, "new query");
    // next_run_at comes from the external scheduler's describe.
    assert_eq!(updated.next_run_at, Some(authoritative));

    let (spec, action) = f
        .engine
        .schedules
        .lock()
        .get(&schedule.external_schedule_id)
        .cloned()
        .unwrap();
    assert_eq!(spec.cron, "0 */6 * * *");
    assert_eq!(action.input["query"], "new query");
}

#[tokio::test]
async fn test_update_next_run_falls_back_to_local_cron() {
    let f = fixture();
    let schedule = f.manager.create(create_input("user-1")).await.unwrap();
    *f.engine.fail_describe.lock() = true;

    let updated = f
        .manager
        .update(
            &schedule.id,
            UpdateScheduleInput {
                cron_expression: Some("0 12 * * *".to_string()),
                ..UpdateScheduleInput::default()
            },
        )
        .await
        .unwrap();

    let next = updated.next_run_at.expect("locally computed next run");
    assert!(next > chrono::Utc::now());
}

#[tokio::test]
async fn test_update_context_null_preserves_empty_clears() {
    let f = fixture();
    let mut input = create_input("user-1");
    input.task_context = Some(serde_json::json!({ "depth": 3 }));
    let schedule = f.manager.create(input).await.unwrap();

    // Explicit null leaves the stored context alone.
    let updated = f
        .manager
        .update(
            &schedule.id,
            UpdateScheduleInput {
                task_context: Some(serde_json::Value::Null),
                name: Some("renamed".to_string()),
                ..UpdateScheduleInput::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.task_context["depth"], 3);

    // An explicit empty object clears it.
    let cleared = f
        .manager
        .update(
            &schedule.id,
            UpdateScheduleInput {
                task_context: Some(serde_json::json!({})),
                ..UpdateScheduleInput::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.task_context, serde_json::json!({}));
}

#[tokio::test]
async fn test_orphan_detection_marks_only_missing_rows() {
    let f = fixture();
    let keep = f.manager.create(create_input("user-1")).await.unwrap();
    let orphan = f.manager.create(create_input("user-2")).await.unwrap();

    // Simulate the external scheduler losing one schedule.
    f.engine
        .schedules
        .lock()
        .remove(&orphan.external_schedule_id);

    let cleaned = f.manager.detect_and_clean_orphaned_schedules().await.unwrap();
    assert_eq!(cleaned, 1);

    assert_eq!(
        f.manager.get(&keep.id).await.unwrap().status,
        ScheduleStatus::Active
    );
    assert_eq!(
        f.manager.get(&orphan.id).await.unwrap().status,
        ScheduleStatus::Deleted
    );
}

#[tokio::test]
async fn test_list_pagination_and_status_filter() {
    let f = fixture();
    for _ in 0..3 {
        f.manager.create(create_input("user-1")).await.unwrap();
    }
    let schedule = f.manager.create(create_input("user-1")).await.unwrap();
    f.manager.pause(&schedule.id, "hold").await.unwrap();

    let active = f
        .manager
        .list(Some("user-1"), Some(ScheduleStatus::Active), 10, 0)
        .await
        .unwrap();
    assert_eq!(active.len(), 3);

    let paused = f
        .manager
        .list(Some("user-1"), Some(ScheduleStatus::Paused), 10, 0)
        .await
        .unwrap();
    assert_eq!(paused.len(), 1);

    let page = f.manager.list(Some("user-1"), None, 2, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    let rest = f.manager.list(Some("user-1"), None, 10, 2).await.unwrap();
    assert_eq!(rest.len(), 2);
}

#[tokio::test]
async fn test_record_execution_updates_run_counters() {
    let f = fixture();
    let schedule = f.manager.create(create_input("user-1")).await.unwrap();

    let now = chrono::Utc::now();
    f.manager
        .record_execution(ScheduleExecution {
            schedule_id: schedule.id.clone(),
            task_id: "task-1".to_string(),
            status: "COMPLETED".to_string(),
            total_cost_usd: 0.42,
            error_message: None,
            completed_at: now,
        })
        .await
        .unwrap();
    f.manager
        .record_execution(ScheduleExecution {
            schedule_id: schedule.id.clone(),
            task_id: "task-2".to_string(),
            status: "FAILED".to_string(),
            total_cost_usd: 0.1,
            error_message: Some("budget exceeded".to_string()),
            completed_at: now,
        })
        .await
        .unwrap();

    let row = f.manager.get(&schedule.id).await.unwrap();
    assert_eq!(row.total_runs, 2);
    assert_eq!(row.successful_runs, 1);
    assert_eq!(row.failed_runs, 1);
    assert_eq!(row.last_run_at, Some(now));
    assert_eq!(f.catalog.executions().len(), 2);
}

//! Shared fixtures: an in-memory application state and a scriptable fake
//! of the durable engine / external scheduler.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use shannon_streaming::breaker::grpc::GrpcBreaker;
use shannon_streaming::breaker::{BreakerSettings, CircuitBreaker};
use shannon_streaming::config::AppConfig;
use shannon_streaming::database::MemoryUserStore;
use shannon_streaming::engine::{
    CreateScheduleRequest, DurableEngine, EngineError, HistoryEvent, ScheduleAction,
    ScheduleClient, ScheduleDescription, ScheduleSpec, StartWorkflowRequest, StartedWorkflow,
    WorkflowDescription, WorkflowRunStatus,
};
use shannon_streaming::scheduler::{
    MemoryScheduleCatalog, ScheduleManager, ScheduleManagerConfig,
};
use shannon_streaming::streaming::backend::MemoryStreamBackend;
use shannon_streaming::streaming::persistence::{
    BatcherConfig, EventLogBatcher, EventLogStore, MemoryEventLogStore,
};
use shannon_streaming::streaming::EventStreamManager;
use shannon_streaming::timeline::TimelineBuilder;
use shannon_streaming::AppState;

/// Scriptable durable engine + external scheduler.
#[derive(Default)]
pub struct FakeEngine {
    pub workflows: Mutex<HashSet<String>>,
    pub signals: Mutex<Vec<(String, String, Value)>>,
    pub history: Mutex<HashMap<String, Vec<HistoryEvent>>>,
    pub schedules: Mutex<HashMap<String, (ScheduleSpec, ScheduleAction)>>,
    pub paused: Mutex<HashSet<String>>,
    pub next_action_time: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    pub fail_describe: Mutex<bool>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_workflow(&self, workflow_id: &str) {
        self.workflows.lock().insert(workflow_id.to_string());
    }

    pub fn set_history(&self, workflow_id: &str, history: Vec<HistoryEvent>) {
        self.history.lock().insert(workflow_id.to_string(), history);
    }

    pub fn external_schedule_ids(&self) -> Vec<String> {
        self.schedules.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl DurableEngine for FakeEngine {
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartedWorkflow, EngineError> {
        self.workflows.lock().insert(request.workflow_id.clone());
        Ok(StartedWorkflow {
            workflow_id: request.workflow_id,
            run_id: "run-1".to_string(),
        })
    }

    async fn signal_workflow(
        &self,
        workflow_id: &str,
        _run_id: Option<&str>,
        signal: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        if !self.workflows.lock().contains(workflow_id) {
            return Err(EngineError::NotFound(workflow_id.to_string()));
        }
        self.signals
            .lock()
            .push((workflow_id.to_string(), signal.to_string(), payload));
        Ok(())
    }

    async fn describe_workflow(
        &self,
        workflow_id: &str,
        _run_id: Option<&str>,
    ) -> Result<WorkflowDescription, EngineError> {
        if !self.workflows.lock().contains(workflow_id) {
            return Err(EngineError::NotFound(workflow_id.to_string()));
        }
        Ok(WorkflowDescription {
            workflow_id: workflow_id.to_string(),
            run_id: "run-1".to_string(),
            status: WorkflowRunStatus::Running,
            start_time: None,
            close_time: None,
        })
    }

    async fn get_workflow_history(
        &self,
        workflow_id: &str,
        _run_id: Option<&str>,
    ) -> Result<Vec<HistoryEvent>, EngineError> {
        self.history
            .lock()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))
    }
}

#[async_trait]
impl ScheduleClient for FakeEngine {
    async fn create(&self, request: CreateScheduleRequest) -> Result<(), EngineError> {
        let mut schedules = self.schedules.lock();
        if schedules.contains_key(&request.schedule_id) {
            return Err(EngineError::AlreadyExists(request.schedule_id));
        }
        schedules.insert(request.schedule_id, (request.spec, request.action));
        Ok(())
    }

    async fn describe(&self, schedule_id: &str) -> Result<ScheduleDescription, EngineError> {
        if *self.fail_describe.lock() {
            return Err(EngineError::Unavailable("scheduler down".to_string()));
        }
        let schedules = self.schedules.lock();
        let (spec, action) = schedules
            .get(schedule_id)
            .ok_or_else(|| EngineError::NotFound(schedule_id.to_string()))?;
        Ok(ScheduleDescription {
            schedule_id: schedule_id.to_string(),
            spec: spec.clone(),
            action: action.clone(),
            paused: self.paused.lock().contains(schedule_id),
            next_action_time: *self.next_action_time.lock(),
        })
    }

    async fn update(
        &self,
        schedule_id: &str,
        spec: ScheduleSpec,
        action: ScheduleAction,
    ) -> Result<(), EngineError> {
        let mut schedules = self.schedules.lock();
        match schedules.get_mut(schedule_id) {
            Some(entry) => {
                *entry = (spec, action);
                Ok(())
            }
            None => Err(EngineError::NotFound(schedule_id.to_string())),
        }
    }

    async fn pause(&self, schedule_id: &str, _note: &str) -> Result<(), EngineError> {
        if !self.schedules.lock().contains_key(schedule_id) {
            return Err(EngineError::NotFound(schedule_id.to_string()));
        }
        self.paused.lock().insert(schedule_id.to_string());
        Ok(())
    }

    async fn unpause(&self, schedule_id: &str, _note: &str) -> Result<(), EngineError> {
        if !self.schedules.lock().contains_key(schedule_id) {
            return Err(EngineError::NotFound(schedule_id.to_string()));
        }
        self.paused.lock().remove(schedule_id);
        Ok(())
    }

    async fn delete(&self, schedule_id: &str) -> Result<(), EngineError> {
        match self.schedules.lock().remove(schedule_id) {
            Some(_) => {
                self.paused.lock().remove(schedule_id);
                Ok(())
            }
            None => Err(EngineError::NotFound(schedule_id.to_string())),
        }
    }
}

/// Everything a gateway test needs, all in-memory.
pub struct TestHarness {
    pub state: AppState,
    pub engine: Arc<FakeEngine>,
    pub event_log: Arc<MemoryEventLogStore>,
    pub catalog: Arc<MemoryScheduleCatalog>,
}

pub fn grpc_breaker() -> GrpcBreaker {
    GrpcBreaker::new(CircuitBreaker::new(BreakerSettings::named("grpc-test")))
}

pub fn test_harness() -> TestHarness {
    test_harness_with_config(AppConfig::default())
}

pub fn test_harness_with_config(config: AppConfig) -> TestHarness {
    let engine = FakeEngine::new();
    let event_log = MemoryEventLogStore::new();
    let catalog = MemoryScheduleCatalog::new();

    let batcher = Arc::new(EventLogBatcher::spawn(
        Arc::clone(&event_log) as Arc<dyn EventLogStore>,
        BatcherConfig {
            batch_size: 10,
            flush_interval: std::time::Duration::from_millis(20),
        },
    ));
    let streaming = Arc::new(EventStreamManager::new(
        MemoryStreamBackend::new(),
        Some(batcher),
        1000,
    ));

    let breaker = grpc_breaker();
    let schedules = Arc::new(ScheduleManager::new(
        Arc::clone(&engine) as Arc<dyn ScheduleClient>,
        Arc::clone(&catalog) as _,
        breaker.clone(),
        ScheduleManagerConfig::default(),
    ));
    let timeline = Arc::new(TimelineBuilder::new(
        Arc::clone(&engine) as Arc<dyn DurableEngine>,
        breaker.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        streaming,
        engine: Arc::clone(&engine) as Arc<dyn DurableEngine>,
        engine_breaker: breaker,
        schedules,
        timeline,
        users: MemoryUserStore::new(),
        event_log: Some(Arc::clone(&event_log) as Arc<dyn EventLogStore>),
    };

    TestHarness {
        state,
        engine,
        event_log,
        catalog,
    }
}

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use scheduler_core::{
    models::{
        now_millis, ExecuteTaskParam, Operation, RouteStrategy, SavepointParam, StartTaskParam,
        StopTaskParam, Task,
    },
    traits::{ExecuteResult, ExecutionContext, JobHandler, SupervisorRpc},
    SchedulerError, SchedulerResult,
};

pub fn execute_param(task_id: i64, handler: &str) -> ExecuteTaskParam {
    ExecuteTaskParam {
        operation: Operation::Trigger,
        task_id,
        instance_id: task_id * 10,
        job_id: 1,
        trigger_time: now_millis(),
        job_handler: handler.to_string(),
        route_strategy: RouteStrategy::RoundRobin,
        execute_timeout_ms: 0,
        worker: None,
        dispatch_attempt: 0,
    }
}

/// 记录Worker上报的Supervisor
#[derive(Default)]
pub struct RecordingSupervisor {
    started: Mutex<Vec<StartTaskParam>>,
    stopped: Mutex<Vec<StopTaskParam>>,
    snapshots: Mutex<Vec<SavepointParam>>,
}

impl RecordingSupervisor {
    pub fn started(&self) -> Vec<StartTaskParam> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<StopTaskParam> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<SavepointParam> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[async_trait]
impl SupervisorRpc for RecordingSupervisor {
    async fn get_task(&self, _task_id: i64) -> SchedulerResult<Option<Task>> {
        Ok(None)
    }

    async fn start_task(&self, param: &StartTaskParam) -> SchedulerResult<Option<Task>> {
        self.started.lock().unwrap().push(param.clone());
        Ok(Some(Task::create(
            param.task_id,
            param.instance_id,
            0,
            1,
            "param",
            Some(param.worker.clone()),
            now_millis(),
        )))
    }

    async fn stop_task(&self, param: &StopTaskParam) -> SchedulerResult<bool> {
        self.stopped.lock().unwrap().push(param.clone());
        Ok(true)
    }

    async fn savepoint(&self, param: &SavepointParam) -> SchedulerResult<bool> {
        self.snapshots.lock().unwrap().push(param.clone());
        Ok(true)
    }

    async fn trigger_job(&self, _job_id: i64) -> SchedulerResult<i64> {
        Err(SchedulerError::Unsupported("trigger_job".to_string()))
    }

    async fn pause_instance(&self, _instance_id: i64) -> SchedulerResult<bool> {
        Ok(false)
    }

    async fn cancel_instance(
        &self,
        _instance_id: i64,
        _operation: Operation,
    ) -> SchedulerResult<bool> {
        Ok(false)
    }

    async fn resume_instance(&self, _instance_id: i64) -> SchedulerResult<bool> {
        Ok(false)
    }
}

/// 睡眠指定时间，响应中断
pub struct SleepHandler {
    duration: Duration,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn execute(&self, ctx: &ExecutionContext) -> SchedulerResult<ExecuteResult> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(ExecuteResult::success()),
            _ = ctx.cancel_token().cancelled() => Ok(ExecuteResult::failure("interrupted")),
        }
    }
}

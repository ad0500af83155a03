#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use scheduler_core::{
    models::{
        now_millis, ExecuteTaskParam, JobHandlerParam, Operation, RouteStrategy, SavepointParam,
        StartTaskParam, StopTaskParam, Task, Worker,
    },
    traits::{SupervisorRpc, TaskTransport, WorkerRpc},
    SchedulerError, SchedulerResult,
};

/// 内存中的Supervisor：任务1存在，其余不存在
#[derive(Default)]
pub struct FakeSupervisor {
    pub stopped: Mutex<Vec<StopTaskParam>>,
    pub canceled: Mutex<Vec<(i64, Operation)>>,
}

#[async_trait]
impl SupervisorRpc for FakeSupervisor {
    async fn get_task(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        Ok((task_id == 1).then(|| Task::create(1, 10, 0, 1, "p", None, now_millis())))
    }

    async fn start_task(&self, param: &StartTaskParam) -> SchedulerResult<Option<Task>> {
        Ok(Some(Task::create(
            param.task_id,
            param.instance_id,
            0,
            1,
            "p",
            Some(param.worker.clone()),
            param.start_time,
        )))
    }

    async fn stop_task(&self, param: &StopTaskParam) -> SchedulerResult<bool> {
        self.stopped.lock().unwrap().push(param.clone());
        Ok(true)
    }

    async fn savepoint(&self, _param: &SavepointParam) -> SchedulerResult<bool> {
        Ok(true)
    }

    async fn trigger_job(&self, job_id: i64) -> SchedulerResult<i64> {
        if job_id == 404 {
            return Err(SchedulerError::JobNotFound { id: job_id });
        }
        Ok(job_id * 100)
    }

    async fn pause_instance(&self, _instance_id: i64) -> SchedulerResult<bool> {
        Err(SchedulerError::StateConflict("实例已结束".to_string()))
    }

    async fn cancel_instance(&self, instance_id: i64, operation: Operation) -> SchedulerResult<bool> {
        self.canceled.lock().unwrap().push((instance_id, operation));
        Ok(true)
    }

    async fn resume_instance(&self, _instance_id: i64) -> SchedulerResult<bool> {
        Ok(true)
    }
}

/// 记录收到的派发，可切换为队列已满
#[derive(Default)]
pub struct FakeWorker {
    pub received: Mutex<Vec<ExecuteTaskParam>>,
    pub full: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl WorkerRpc for FakeWorker {
    async fn verify(&self, param: &JobHandlerParam) -> SchedulerResult<bool> {
        Ok(param.job_handler == "shell")
    }

    async fn split(&self, param: &JobHandlerParam) -> SchedulerResult<Vec<String>> {
        Ok(param.job_param.split(',').map(str::to_string).collect())
    }
}

#[async_trait]
impl TaskTransport for FakeWorker {
    async fn dispatch(&self, _worker: &Worker, params: &[ExecuteTaskParam]) -> SchedulerResult<()> {
        if self.full.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SchedulerError::ResourceExhausted("队列已满".to_string()));
        }
        self.received.lock().unwrap().extend_from_slice(params);
        Ok(())
    }
}

pub fn worker_routes(fake: &Arc<FakeWorker>) -> axum::Router {
    scheduler_api::create_app(scheduler_api::worker_routes(fake.clone(), fake.clone()))
}

pub fn supervisor_routes(fake: &Arc<FakeSupervisor>) -> axum::Router {
    scheduler_api::create_app(scheduler_api::supervisor_routes(fake.clone()))
}

pub fn handler_param(handler: &str, job_param: &str) -> JobHandlerParam {
    JobHandlerParam {
        group: "app".to_string(),
        job_handler: handler.to_string(),
        job_param: job_param.to_string(),
        route_strategy: RouteStrategy::RoundRobin,
    }
}

pub fn execute_param(task_id: i64) -> ExecuteTaskParam {
    ExecuteTaskParam {
        operation: Operation::Trigger,
        task_id,
        instance_id: 10,
        job_id: 1,
        trigger_time: now_millis(),
        job_handler: "shell".to_string(),
        route_strategy: RouteStrategy::RoundRobin,
        execute_timeout_ms: 0,
        worker: None,
        dispatch_attempt: 0,
    }
}

/// 在随机端口上启动服务，返回监听地址
pub async fn spawn_server(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    address
}

/// 一个没有服务监听的端口
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

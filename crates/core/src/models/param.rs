use serde::{Deserialize, Serialize};

use super::{ExecuteState, Instance, Job, Operation, RouteStrategy, Task, Worker};

/// 派发给Worker的执行指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteTaskParam {
    pub operation: Operation,
    pub task_id: i64,
    pub instance_id: i64,
    pub job_id: i64,
    pub trigger_time: i64,
    pub job_handler: String,
    pub route_strategy: RouteStrategy,
    pub execute_timeout_ms: i64,
    pub worker: Option<Worker>,
    /// Supervisor端的派发重试次数
    #[serde(default)]
    pub dispatch_attempt: u32,
}

impl ExecuteTaskParam {
    pub fn from_task(operation: Operation, job: &Job, instance: &Instance, task: &Task) -> Self {
        Self {
            operation,
            task_id: task.task_id,
            instance_id: instance.instance_id,
            job_id: job.job_id,
            trigger_time: instance.trigger_time,
            job_handler: job.job_handler.clone(),
            route_strategy: job.route_strategy,
            execute_timeout_ms: job.execute_timeout_ms,
            worker: task.worker.clone(),
            dispatch_attempt: 0,
        }
    }
}

/// verify/split时传给处理器的任务级参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandlerParam {
    pub group: String,
    pub job_handler: String,
    pub job_param: String,
    pub route_strategy: RouteStrategy,
}

impl From<&Job> for JobHandlerParam {
    fn from(job: &Job) -> Self {
        Self {
            group: job.group.clone(),
            job_handler: job.job_handler.clone(),
            job_param: job.job_param.clone(),
            route_strategy: job.route_strategy,
        }
    }
}

/// Worker开始执行分片任务时上报
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTaskParam {
    pub job_id: i64,
    pub instance_id: i64,
    pub task_id: i64,
    pub worker: Worker,
    pub start_time: i64,
}

/// Worker结束、暂停或取消分片任务时上报
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTaskParam {
    pub instance_id: i64,
    pub task_id: i64,
    pub worker: Worker,
    pub operation: Operation,
    pub to_state: ExecuteState,
    pub error_msg: Option<String>,
}

/// 保存执行快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavepointParam {
    pub task_id: i64,
    pub worker: Worker,
    pub snapshot: String,
}

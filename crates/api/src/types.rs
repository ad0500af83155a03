//! RPC请求体与路径定义，服务端路由和客户端共用

use serde::{Deserialize, Serialize};

use scheduler_core::models::{ExecuteTaskParam, Operation, Worker};

pub mod paths {
    pub const HEALTH: &str = "/health";

    pub const WORKER_VERIFY: &str = "/worker/rpc/verify";
    pub const WORKER_SPLIT: &str = "/worker/rpc/split";
    pub const WORKER_DISPATCH: &str = "/worker/rpc/dispatch";

    pub const SUPERVISOR_GET_TASK: &str = "/supervisor/rpc/task/get";
    pub const SUPERVISOR_START_TASK: &str = "/supervisor/rpc/task/start";
    pub const SUPERVISOR_STOP_TASK: &str = "/supervisor/rpc/task/stop";
    pub const SUPERVISOR_SAVEPOINT: &str = "/supervisor/rpc/task/savepoint";
    pub const SUPERVISOR_TRIGGER_JOB: &str = "/supervisor/rpc/job/trigger";
    pub const SUPERVISOR_PAUSE_INSTANCE: &str = "/supervisor/rpc/instance/pause";
    pub const SUPERVISOR_CANCEL_INSTANCE: &str = "/supervisor/rpc/instance/cancel";
    pub const SUPERVISOR_RESUME_INSTANCE: &str = "/supervisor/rpc/instance/resume";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdRequest {
    pub task_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIdRequest {
    pub job_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceIdRequest {
    pub instance_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelInstanceRequest {
    pub instance_id: i64,
    pub operation: Operation,
}

/// 派发请求，携带目标Worker身份供接收端核对
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub worker: Worker,
    pub params: Vec<ExecuteTaskParam>,
}

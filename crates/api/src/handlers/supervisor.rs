use std::sync::Arc;

use axum::{extract::State, Json};

use scheduler_core::{
    models::{SavepointParam, StartTaskParam, StopTaskParam, Task},
    traits::SupervisorRpc,
};

use crate::error::{ApiError, ApiResult};
use crate::response::{success, ApiResponse};
use crate::types::{CancelInstanceRequest, InstanceIdRequest, JobIdRequest, TaskIdRequest};

pub type SupervisorState = Arc<dyn SupervisorRpc>;

pub async fn get_task(
    State(rpc): State<SupervisorState>,
    Json(req): Json<TaskIdRequest>,
) -> ApiResult<ApiResponse<Option<Task>>> {
    Ok(success(rpc.get_task(req.task_id).await?))
}

pub async fn start_task(
    State(rpc): State<SupervisorState>,
    Json(param): Json<StartTaskParam>,
) -> ApiResult<ApiResponse<Option<Task>>> {
    Ok(success(rpc.start_task(&param).await?))
}

pub async fn stop_task(
    State(rpc): State<SupervisorState>,
    Json(param): Json<StopTaskParam>,
) -> ApiResult<ApiResponse<bool>> {
    Ok(success(rpc.stop_task(&param).await?))
}

pub async fn savepoint(
    State(rpc): State<SupervisorState>,
    Json(param): Json<SavepointParam>,
) -> ApiResult<ApiResponse<bool>> {
    Ok(success(rpc.savepoint(&param).await?))
}

/// 手动触发，返回新实例ID
pub async fn trigger_job(
    State(rpc): State<SupervisorState>,
    Json(req): Json<JobIdRequest>,
) -> ApiResult<ApiResponse<i64>> {
    Ok(success(rpc.trigger_job(req.job_id).await?))
}

pub async fn pause_instance(
    State(rpc): State<SupervisorState>,
    Json(req): Json<InstanceIdRequest>,
) -> ApiResult<ApiResponse<bool>> {
    Ok(success(rpc.pause_instance(req.instance_id).await?))
}

pub async fn cancel_instance(
    State(rpc): State<SupervisorState>,
    Json(req): Json<CancelInstanceRequest>,
) -> ApiResult<ApiResponse<bool>> {
    if !req.operation.is_stop() {
        return Err(ApiError::BadRequest(format!(
            "取消操作类型无效: {}",
            req.operation
        )));
    }
    Ok(success(
        rpc.cancel_instance(req.instance_id, req.operation).await?,
    ))
}

pub async fn resume_instance(
    State(rpc): State<SupervisorState>,
    Json(req): Json<InstanceIdRequest>,
) -> ApiResult<ApiResponse<bool>> {
    Ok(success(rpc.resume_instance(req.instance_id).await?))
}

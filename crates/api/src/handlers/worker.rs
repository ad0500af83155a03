use std::sync::Arc;

use axum::{extract::State, Json};

use scheduler_core::{
    models::JobHandlerParam,
    traits::{TaskTransport, WorkerRpc},
};

use crate::error::ApiResult;
use crate::response::{success, ApiResponse};
use crate::types::DispatchRequest;

#[derive(Clone)]
pub struct WorkerState {
    pub rpc: Arc<dyn WorkerRpc>,
    /// 接收派发的入口，即Worker本地的任务接收器
    pub receiver: Arc<dyn TaskTransport>,
}

pub async fn verify(
    State(state): State<WorkerState>,
    Json(param): Json<JobHandlerParam>,
) -> ApiResult<ApiResponse<bool>> {
    Ok(success(state.rpc.verify(&param).await?))
}

pub async fn split(
    State(state): State<WorkerState>,
    Json(param): Json<JobHandlerParam>,
) -> ApiResult<ApiResponse<Vec<String>>> {
    Ok(success(state.rpc.split(&param).await?))
}

pub async fn dispatch(
    State(state): State<WorkerState>,
    Json(req): Json<DispatchRequest>,
) -> ApiResult<ApiResponse<()>> {
    state.receiver.dispatch(&req.worker, &req.params).await?;
    Ok(success(()))
}

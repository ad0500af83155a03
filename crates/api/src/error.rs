use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use scheduler_core::SchedulerError;
use tracing::{error, warn};

use crate::response::ErrorResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Scheduler(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Scheduler(e) => match e {
                SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
                SchedulerError::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
                SchedulerError::TaskNotFound { .. } => "TASK_NOT_FOUND",
                SchedulerError::InvalidTrigger { .. } | SchedulerError::InvalidCron { .. } => {
                    "INVALID_TRIGGER"
                }
                SchedulerError::InvalidJobParam(_) => "INVALID_JOB_PARAM",
                SchedulerError::Unsupported(_) => "UNSUPPORTED",
                SchedulerError::DuplicateKey(_)
                | SchedulerError::StateConflict(_)
                | SchedulerError::IllegalTransition { .. } => "STATE_CONFLICT",
                SchedulerError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
                SchedulerError::NoAvailableWorker { .. } => "NO_AVAILABLE_WORKER",
                SchedulerError::Timeout => "TIMEOUT",
                SchedulerError::Rpc { .. } => "RPC_ERROR",
                _ => "INTERNAL_ERROR",
            },
            ApiError::BadRequest(_) => "BAD_REQUEST",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        } else {
            warn!("请求被拒绝({}): {}", status.as_u16(), self);
        }
        let message = match &self {
            ApiError::Scheduler(e) => e.to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
        };
        (status, Json(ErrorResponse::new(self.code(), message))).into_response()
    }
}

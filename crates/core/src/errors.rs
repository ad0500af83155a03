use thiserror::Error;

use crate::models::{ExecuteState, TriggerType};

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("无效的触发配置[{trigger_type}]: {value} - {message}")]
    InvalidTrigger {
        trigger_type: TriggerType,
        value: String,
        message: String,
    },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("无效的任务参数: {0}")]
    InvalidJobParam(String),

    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("任务实例未找到: {id}")]
    InstanceNotFound { id: i64 },

    #[error("分片任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("唯一键冲突: {0}")]
    DuplicateKey(String),

    #[error("状态冲突: {0}")]
    StateConflict(String),

    #[error("非法的状态转换: {from} -> {to}")]
    IllegalTransition { from: ExecuteState, to: ExecuteState },

    #[error("分组[{group}]没有可用的Worker")]
    NoAvailableWorker { group: String },

    #[error("RPC调用失败(status={status:?}): {message}")]
    Rpc { status: Option<u16>, message: String },

    #[error("执行超时")]
    Timeout,

    #[error("分布式锁错误: {0}")]
    Lock(String),

    #[error("资源耗尽: {0}")]
    ResourceExhausted(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis错误: {0}")]
    Redis(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 是否为可以换节点重试的传输类错误
    pub fn is_retriable(&self) -> bool {
        match self {
            SchedulerError::Timeout => true,
            SchedulerError::Rpc { status: None, .. } => true,
            SchedulerError::Rpc {
                status: Some(status),
                ..
            } => is_retriable_status(*status),
            SchedulerError::ResourceExhausted(_) => true,
            _ => false,
        }
    }

    /// 任务定义类错误：同步返回给调用方，不持久化
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidTrigger { .. }
                | SchedulerError::InvalidCron { .. }
                | SchedulerError::InvalidJobParam(_)
                | SchedulerError::Unsupported(_)
        )
    }

    /// 对应的HTTP状态码
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::JobNotFound { .. }
            | SchedulerError::InstanceNotFound { .. }
            | SchedulerError::TaskNotFound { .. } => 404,
            SchedulerError::InvalidTrigger { .. }
            | SchedulerError::InvalidCron { .. }
            | SchedulerError::InvalidJobParam(_)
            | SchedulerError::Unsupported(_)
            | SchedulerError::Serialization(_) => 400,
            SchedulerError::DuplicateKey(_)
            | SchedulerError::StateConflict(_)
            | SchedulerError::IllegalTransition { .. } => 409,
            SchedulerError::ResourceExhausted(_) => 429,
            SchedulerError::NoAvailableWorker { .. } => 503,
            SchedulerError::Timeout => 504,
            SchedulerError::Rpc {
                status: Some(status),
                ..
            } => *status,
            _ => 500,
        }
    }
}

/// 超时、409/423/425/429以及5xx允许重试，其余状态码立即失败
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 423 | 425 | 429) || (500..600).contains(&status)
}

impl From<redis::RedisError> for SchedulerError {
    fn from(e: redis::RedisError) -> Self {
        SchedulerError::Redis(e.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

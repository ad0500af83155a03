//! 任务处理器接口定义
//!
//! 处理器由使用方实现，Supervisor在创建任务和触发实例时调用`verify`、`split`，
//! Worker对每个分片依次调用`verify_task -> init -> execute -> destroy`。
//!
//! ## 取消与暂停
//!
//! 暂停/取消是协作式的：`ExecutionContext::cancel_token()`被触发后，处理器应在下一个
//! 等待点尽快返回。不响应取消的处理器只能由超时守护来终止。
//!
//! ```ignore
//! use async_trait::async_trait;
//! use scheduler_core::traits::{ExecuteResult, ExecutionContext, JobHandler};
//!
//! struct PrimeCountHandler;
//!
//! #[async_trait]
//! impl JobHandler for PrimeCountHandler {
//!     async fn execute(&self, ctx: &ExecutionContext) -> SchedulerResult<ExecuteResult> {
//!         tokio::select! {
//!             _ = ctx.cancel_token().cancelled() => Ok(ExecuteResult::failure("canceled")),
//!             n = count_primes(&ctx.task_param) => {
//!                 ctx.savepoint(n.to_string()).await?;
//!                 Ok(ExecuteResult::success())
//!             }
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::SupervisorRpc;
use crate::{
    models::{truncate_text, JobHandlerParam, SavepointParam, Worker, MAX_SNAPSHOT_LENGTH},
    SchedulerError, SchedulerResult,
};

/// 处理器执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub success: bool,
    pub message: Option<String>,
}

impl ExecuteResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// 分片任务的执行上下文
#[derive(Clone)]
pub struct ExecutionContext {
    pub job_id: i64,
    pub instance_id: i64,
    pub task_id: i64,
    pub shard_index: u32,
    pub shard_count: u32,
    pub trigger_time: i64,
    pub task_param: String,
    /// 上一次保存的快照，用于断点续跑
    pub execute_snapshot: Option<String>,
    cancel: CancellationToken,
    worker: Worker,
    supervisor: Arc<dyn SupervisorRpc>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: i64,
        instance_id: i64,
        task_id: i64,
        shard_index: u32,
        shard_count: u32,
        trigger_time: i64,
        task_param: String,
        execute_snapshot: Option<String>,
        cancel: CancellationToken,
        worker: Worker,
        supervisor: Arc<dyn SupervisorRpc>,
    ) -> Self {
        Self {
            job_id,
            instance_id,
            task_id,
            shard_index,
            shard_count,
            trigger_time,
            task_param,
            execute_snapshot,
            cancel,
            worker,
            supervisor,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// 保存执行快照
    pub async fn savepoint(&self, snapshot: impl Into<String>) -> SchedulerResult<()> {
        let snapshot = snapshot.into();
        if snapshot.chars().count() > MAX_SNAPSHOT_LENGTH {
            return Err(SchedulerError::InvalidJobParam(format!(
                "快照长度超过限制: {}",
                truncate_text(&snapshot, 32)
            )));
        }
        let param = SavepointParam {
            task_id: self.task_id,
            worker: self.worker.clone(),
            snapshot,
        };
        if self.supervisor.savepoint(&param).await? {
            Ok(())
        } else {
            Err(SchedulerError::StateConflict(format!(
                "保存快照失败: task_id={}",
                self.task_id
            )))
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("instance_id", &self.instance_id)
            .field("task_id", &self.task_id)
            .field("shard_index", &self.shard_index)
            .field("shard_count", &self.shard_count)
            .field("worker", &self.worker)
            .finish()
    }
}

/// 任务处理器
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// 创建/更新任务时的参数校验
    async fn verify(&self, _param: &JobHandlerParam) -> SchedulerResult<bool> {
        Ok(true)
    }

    /// 拆分为多个分片，默认只有一个分片并透传任务参数
    async fn split(&self, param: &JobHandlerParam) -> SchedulerResult<Vec<String>> {
        Ok(vec![param.job_param.clone()])
    }

    /// 执行前的分片级校验
    async fn verify_task(&self, _ctx: &ExecutionContext) -> SchedulerResult<bool> {
        Ok(true)
    }

    async fn init(&self, _ctx: &ExecutionContext) -> SchedulerResult<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext) -> SchedulerResult<ExecuteResult>;

    /// 无论成功失败都会调用
    async fn destroy(&self, _ctx: &ExecutionContext) {}
}

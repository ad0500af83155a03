use serde::{Deserialize, Serialize};

use super::{ExecuteState, Worker};

/// 快照最大长度
pub const MAX_SNAPSHOT_LENGTH: usize = 65535;

/// 错误信息最大长度
pub const MAX_ERROR_MSG_LENGTH: usize = 2048;

/// 实例的一个分片，派发给Worker执行的最小单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub instance_id: i64,
    /// 从0开始的分片序号
    pub shard_index: u32,
    pub shard_count: u32,
    pub task_param: String,
    pub execute_state: ExecuteState,
    /// 广播任务在拆分时就已经指定
    pub worker: Option<Worker>,
    pub execute_start_time: Option<i64>,
    pub execute_end_time: Option<i64>,
    pub execute_snapshot: Option<String>,
    pub error_msg: Option<String>,
    pub update_time: i64,
}

impl Task {
    pub fn create(
        task_id: i64,
        instance_id: i64,
        shard_index: u32,
        shard_count: u32,
        task_param: impl Into<String>,
        worker: Option<Worker>,
        now: i64,
    ) -> Self {
        Self {
            task_id,
            instance_id,
            shard_index,
            shard_count,
            task_param: task_param.into(),
            execute_state: ExecuteState::Waiting,
            worker,
            execute_start_time: None,
            execute_end_time: None,
            execute_snapshot: None,
            error_msg: None,
            update_time: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.execute_state.is_terminal()
    }
}

/// 按字符截断，避免切断UTF-8字符
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

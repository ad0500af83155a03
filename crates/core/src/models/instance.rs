use serde::{Deserialize, Serialize};

use super::{RunState, RunType};

/// 任务的一次触发
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: i64,
    pub job_id: i64,
    pub run_type: RunType,
    pub trigger_time: i64,
    pub run_state: RunState,
    /// 重试或依赖的上游实例
    pub parent_instance_id: Option<i64>,
    /// 重试/依赖链的根实例
    pub root_instance_id: Option<i64>,
    pub retried_count: u32,
    pub run_start_time: Option<i64>,
    pub run_end_time: Option<i64>,
    /// 恢复扫描的下次检查时间
    pub next_scan_time: i64,
    /// 心跳时间
    pub update_time: i64,
    pub version: i64,
}

impl Instance {
    pub fn create(
        instance_id: i64,
        job_id: i64,
        run_type: RunType,
        trigger_time: i64,
        retried_count: u32,
        now: i64,
    ) -> Self {
        Self {
            instance_id,
            job_id,
            run_type,
            trigger_time,
            run_state: RunState::Waiting,
            parent_instance_id: None,
            root_instance_id: None,
            retried_count,
            run_start_time: None,
            run_end_time: None,
            next_scan_time: trigger_time.max(now),
            update_time: now,
            version: 0,
        }
    }

    pub fn obtain_root_instance_id(&self) -> i64 {
        self.root_instance_id.unwrap_or(self.instance_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.run_state.is_terminal()
    }

    pub fn mark_terminated(&mut self, run_state: RunState, run_end_time: i64) {
        self.run_state = run_state;
        self.run_end_time = Some(run_end_time);
    }
}

use serde::{Deserialize, Serialize};

use super::{
    CollidedStrategy, JobState, MisfireStrategy, RetryType, RouteStrategy, RunState, TriggerType,
};
use crate::errors::{SchedulerError, SchedulerResult};

/// FIXED_DELAY任务在实例运行期间的下次触发时间占位值
pub const AWAITING_COMPLETION: i64 = i64::MAX;

/// 调度任务定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: i64,
    /// 路由分组
    pub group: String,
    pub job_name: String,
    /// Worker端的处理器名称
    pub job_handler: String,
    #[serde(default)]
    pub job_param: String,
    pub job_state: JobState,
    pub trigger_type: TriggerType,
    pub trigger_value: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub collided_strategy: CollidedStrategy,
    pub misfire_strategy: MisfireStrategy,
    pub route_strategy: RouteStrategy,
    pub retry_type: RetryType,
    pub retry_count: u32,
    /// 重试间隔(毫秒)，第N次重试延迟 N * retry_interval_ms
    pub retry_interval_ms: i64,
    /// 0表示不限制
    pub execute_timeout_ms: i64,
    pub last_trigger_time: Option<i64>,
    pub next_trigger_time: Option<i64>,
    /// 扫描推迟到此时间之后
    #[serde(default)]
    pub next_scan_time: i64,
    #[serde(default)]
    pub scan_failed_count: u32,
    pub remark: Option<String>,
    /// 乐观锁版本号
    #[serde(default)]
    pub version: i64,
}

impl Job {
    pub fn new(
        group: impl Into<String>,
        job_name: impl Into<String>,
        job_handler: impl Into<String>,
        trigger_type: TriggerType,
        trigger_value: impl Into<String>,
    ) -> Self {
        Self {
            job_id: 0,
            group: group.into(),
            job_name: job_name.into(),
            job_handler: job_handler.into(),
            job_param: String::new(),
            job_state: JobState::Enable,
            trigger_type,
            trigger_value: trigger_value.into(),
            start_time: None,
            end_time: None,
            collided_strategy: CollidedStrategy::Concurrent,
            misfire_strategy: MisfireStrategy::Last,
            route_strategy: RouteStrategy::RoundRobin,
            retry_type: RetryType::None,
            retry_count: 0,
            retry_interval_ms: 0,
            execute_timeout_ms: 0,
            last_trigger_time: None,
            next_trigger_time: None,
            next_scan_time: 0,
            scan_failed_count: 0,
            remark: None,
            version: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.job_state == JobState::Enable
    }

    /// 实例以`run_state`结束、已重试`retried_count`次后是否还能继续重试
    pub fn retryable(&self, run_state: RunState, retried_count: u32) -> bool {
        run_state.is_failure()
            && self.retry_type != RetryType::None
            && retried_count < self.retry_count
    }

    pub fn compute_retry_trigger_time(&self, retried_count: u32, now: i64) -> i64 {
        now + self.retry_interval_ms.max(0) * i64::from(retried_count)
    }

    /// DEPEND类型的父任务ID列表
    pub fn parent_job_ids(&self) -> SchedulerResult<Vec<i64>> {
        if self.trigger_type != TriggerType::Depend {
            return Ok(Vec::new());
        }
        parse_job_ids(&self.trigger_value)
    }

    /// 基本字段校验，不包括触发配置
    pub fn verify(&self) -> SchedulerResult<()> {
        if self.group.trim().is_empty() {
            return Err(SchedulerError::InvalidJobParam("group不能为空".to_string()));
        }
        if self.job_handler.trim().is_empty() {
            return Err(SchedulerError::InvalidJobParam(
                "job_handler不能为空".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(SchedulerError::InvalidJobParam(format!(
                    "开始时间不能晚于结束时间: {start} > {end}"
                )));
            }
        }
        if self.retry_type != RetryType::None && self.retry_count == 0 {
            return Err(SchedulerError::InvalidJobParam(
                "重试类型不为NONE时重试次数必须大于0".to_string(),
            ));
        }
        if self.execute_timeout_ms < 0 || self.retry_interval_ms < 0 {
            return Err(SchedulerError::InvalidJobParam(
                "超时时间与重试间隔不能为负数".to_string(),
            ));
        }
        Ok(())
    }
}

/// 解析逗号分隔的任务ID
pub fn parse_job_ids(text: &str) -> SchedulerResult<Vec<i64>> {
    let mut ids = Vec::new();
    for part in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match part.parse::<i64>() {
            Ok(id) if id > 0 => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            _ => {
                return Err(SchedulerError::InvalidTrigger {
                    trigger_type: TriggerType::Depend,
                    value: text.to_string(),
                    message: format!("无效的父任务ID: {part}"),
                })
            }
        }
    }
    if ids.is_empty() {
        return Err(SchedulerError::InvalidTrigger {
            trigger_type: TriggerType::Depend,
            value: text.to_string(),
            message: "父任务ID列表不能为空".to_string(),
        });
    }
    Ok(ids)
}

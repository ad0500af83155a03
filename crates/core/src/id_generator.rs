use std::sync::Mutex;

use crate::{models::now_millis, SchedulerError, SchedulerResult};

/// 2023-01-01T00:00:00Z
const EPOCH_MS: i64 = 1_672_531_200_000;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER_ID: u32 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// 实例、任务ID生成
pub trait IdGenerator: Send + Sync {
    fn generate_id(&self) -> SchedulerResult<i64>;
}

struct SnowflakeState {
    last_timestamp: i64,
    sequence: i64,
}

/// 雪花算法：41位时间戳 + 10位节点号 + 12位序列
pub struct Snowflake {
    worker_id: i64,
    state: Mutex<SnowflakeState>,
}

impl Snowflake {
    pub fn new(worker_id: u32) -> SchedulerResult<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(SchedulerError::Configuration(format!(
                "雪花算法节点号超出范围: {worker_id}"
            )));
        }
        Ok(Self {
            worker_id: worker_id as i64,
            state: Mutex::new(SnowflakeState {
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    /// 由服务标识派生节点号
    pub fn from_identity(identity: &str) -> Self {
        let hash = crate::hash_ring::HashFunction::Fnv.hash(identity);
        Self {
            worker_id: (hash & MAX_WORKER_ID) as i64,
            state: Mutex::new(SnowflakeState {
                last_timestamp: -1,
                sequence: 0,
            }),
        }
    }
}

impl IdGenerator for Snowflake {
    fn generate_id(&self) -> SchedulerResult<i64> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SchedulerError::Internal(format!("ID生成器锁异常: {e}")))?;

        let mut timestamp = now_millis();
        if timestamp < state.last_timestamp {
            // 时钟小幅回拨时沿用上次的时间戳
            if state.last_timestamp - timestamp > 1_000 {
                return Err(SchedulerError::Internal(format!(
                    "时钟回拨过大: {}ms",
                    state.last_timestamp - timestamp
                )));
            }
            timestamp = state.last_timestamp;
        }

        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while timestamp <= state.last_timestamp {
                    std::hint::spin_loop();
                    timestamp = now_millis().max(timestamp);
                    if timestamp <= state.last_timestamp {
                        std::thread::yield_now();
                    }
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = timestamp;

        Ok(((timestamp - EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence)
    }
}

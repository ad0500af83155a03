pub mod instance;
pub mod job;
pub mod param;
pub mod policy;
pub mod server;
pub mod state;
pub mod task;

pub use instance::Instance;
pub use job::{parse_job_ids, Job, AWAITING_COMPLETION};
pub use param::{ExecuteTaskParam, JobHandlerParam, SavepointParam, StartTaskParam, StopTaskParam};
pub use policy::{
    CollidedStrategy, JobState, MisfireStrategy, RetryType, RouteStrategy, RunType, TagInfo,
    TriggerType,
};
pub use server::{Server, Supervisor, Worker};
pub use state::{obtain_run_state, ExecuteState, Operation, RunState};
pub use task::{truncate_text, Task, MAX_ERROR_MSG_LENGTH, MAX_SNAPSHOT_LENGTH};

/// 当前时间(毫秒)
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

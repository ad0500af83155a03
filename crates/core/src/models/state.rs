use std::fmt;

use serde::{Deserialize, Serialize};

/// 任务实例运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Waiting,
    Running,
    Paused,
    Finished,
    Canceled,
}

impl RunState {
    pub const PAUSABLE: [RunState; 2] = [RunState::Waiting, RunState::Running];
    pub const TERMINABLE: [RunState; 3] = [RunState::Waiting, RunState::Running, RunState::Paused];

    pub fn value(self) -> i32 {
        match self {
            RunState::Waiting => 10,
            RunState::Running => 20,
            RunState::Paused => 30,
            RunState::Finished => 40,
            RunState::Canceled => 50,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Canceled)
    }

    pub fn is_failure(self) -> bool {
        self == RunState::Canceled
    }

    pub fn is_pausable(self) -> bool {
        Self::PAUSABLE.contains(&self)
    }

    /// 实例状态的合法迁移
    pub fn can_transit_to(self, to: RunState) -> bool {
        match (self, to) {
            (RunState::Waiting, RunState::Running) => true,
            (RunState::Waiting | RunState::Running, RunState::Paused) => true,
            (RunState::Paused, RunState::Waiting) => true,
            (from, RunState::Finished | RunState::Canceled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Waiting => "WAITING",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Finished => "FINISHED",
            RunState::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// 分片任务执行状态：粗粒度的RunState加上细粒度的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecuteState {
    Waiting,
    Executing,
    Paused,
    Finished,
    /// 找不到任务处理器或实例已不可用
    InstanceFailed,
    VerifyFailed,
    InitException,
    ExecuteFailed,
    ExecuteException,
    ExecuteTimeout,
    ExecuteCollided,
    ManualCanceled,
    /// 广播任务的目标Worker在派发前已下线
    WaitingCanceled,
    DispatchFailed,
    /// Worker死亡或异常取消
    ExecuteAborted,
}

impl ExecuteState {
    pub const PAUSABLE: [ExecuteState; 2] = [ExecuteState::Waiting, ExecuteState::Executing];
    pub const EXECUTABLE: [ExecuteState; 3] = [
        ExecuteState::Waiting,
        ExecuteState::Executing,
        ExecuteState::Paused,
    ];

    pub fn value(self) -> i32 {
        match self {
            ExecuteState::Waiting => 10,
            ExecuteState::Executing => 20,
            ExecuteState::Paused => 30,
            ExecuteState::Finished => 40,
            ExecuteState::InstanceFailed => 50,
            ExecuteState::VerifyFailed => 51,
            ExecuteState::InitException => 52,
            ExecuteState::ExecuteFailed => 53,
            ExecuteState::ExecuteException => 54,
            ExecuteState::ExecuteTimeout => 55,
            ExecuteState::ExecuteCollided => 56,
            ExecuteState::ManualCanceled => 57,
            ExecuteState::WaitingCanceled => 58,
            ExecuteState::DispatchFailed => 59,
            ExecuteState::ExecuteAborted => 60,
        }
    }

    pub fn run_state(self) -> RunState {
        match self {
            ExecuteState::Waiting => RunState::Waiting,
            ExecuteState::Executing => RunState::Running,
            ExecuteState::Paused => RunState::Paused,
            ExecuteState::Finished => RunState::Finished,
            _ => RunState::Canceled,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.run_state().is_terminal()
    }

    pub fn is_failure(self) -> bool {
        self.run_state().is_failure()
    }

    pub fn is_pausable(self) -> bool {
        Self::PAUSABLE.contains(&self)
    }

    /// 分片任务状态的合法迁移
    pub fn can_transit_to(self, to: ExecuteState) -> bool {
        match self {
            ExecuteState::Waiting => to != ExecuteState::Waiting && to != ExecuteState::Finished,
            ExecuteState::Executing => {
                to != ExecuteState::Waiting && to != ExecuteState::Executing
            }
            ExecuteState::Paused => {
                to == ExecuteState::Waiting || (to.is_failure() && to != ExecuteState::DispatchFailed)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ExecuteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecuteState::Waiting => "WAITING",
            ExecuteState::Executing => "EXECUTING",
            ExecuteState::Paused => "PAUSED",
            ExecuteState::Finished => "FINISHED",
            ExecuteState::InstanceFailed => "INSTANCE_FAILED",
            ExecuteState::VerifyFailed => "VERIFY_FAILED",
            ExecuteState::InitException => "INIT_EXCEPTION",
            ExecuteState::ExecuteFailed => "EXECUTE_FAILED",
            ExecuteState::ExecuteException => "EXECUTE_EXCEPTION",
            ExecuteState::ExecuteTimeout => "EXECUTE_TIMEOUT",
            ExecuteState::ExecuteCollided => "EXECUTE_COLLIDED",
            ExecuteState::ManualCanceled => "MANUAL_CANCELED",
            ExecuteState::WaitingCanceled => "WAITING_CANCELED",
            ExecuteState::DispatchFailed => "DISPATCH_FAILED",
            ExecuteState::ExecuteAborted => "EXECUTE_ABORTED",
        };
        f.write_str(name)
    }
}

/// 状态迁移请求，应用时必须做比较并交换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Trigger,
    Pause,
    ManualCancel,
    ExceptionCancel,
    CollidedCancel,
    Resume,
}

impl Operation {
    /// 允许的源状态
    pub fn from_states(self) -> &'static [ExecuteState] {
        match self {
            Operation::Trigger => &[ExecuteState::Waiting],
            Operation::Pause => &ExecuteState::PAUSABLE,
            Operation::ManualCancel | Operation::ExceptionCancel | Operation::CollidedCancel => {
                &ExecuteState::EXECUTABLE
            }
            Operation::Resume => &[ExecuteState::Paused],
        }
    }

    /// 目标状态
    pub fn to_state(self) -> ExecuteState {
        match self {
            Operation::Trigger => ExecuteState::Executing,
            Operation::Pause => ExecuteState::Paused,
            Operation::ManualCancel => ExecuteState::ManualCanceled,
            Operation::ExceptionCancel => ExecuteState::ExecuteAborted,
            Operation::CollidedCancel => ExecuteState::ExecuteCollided,
            Operation::Resume => ExecuteState::Waiting,
        }
    }

    /// 基于当前状态计算迁移结果，不合法时返回None（视为空操作）
    pub fn apply(self, current: ExecuteState) -> Option<ExecuteState> {
        if self.from_states().contains(&current) {
            Some(self.to_state())
        } else {
            None
        }
    }

    pub fn is_trigger(self) -> bool {
        self == Operation::Trigger
    }

    /// 需要发给Worker中断正在执行的任务
    pub fn is_stop(self) -> bool {
        matches!(
            self,
            Operation::Pause
                | Operation::ManualCancel
                | Operation::ExceptionCancel
                | Operation::CollidedCancel
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Trigger => "TRIGGER",
            Operation::Pause => "PAUSE",
            Operation::ManualCancel => "MANUAL_CANCEL",
            Operation::ExceptionCancel => "EXCEPTION_CANCEL",
            Operation::CollidedCancel => "COLLIDED_CANCEL",
            Operation::Resume => "RESUME",
        };
        f.write_str(name)
    }
}

/// 根据分片任务状态汇总出实例状态
///
/// 全部终态时：存在失败则为CANCELED，否则FINISHED；
/// 不存在WAITING/EXECUTING的任务时为PAUSED；其余情况返回None表示仍在运行。
pub fn obtain_run_state(states: &[ExecuteState]) -> Option<RunState> {
    if states.iter().all(|s| s.is_terminal()) {
        if states.iter().any(|s| s.is_failure()) {
            return Some(RunState::Canceled);
        }
        return Some(RunState::Finished);
    }
    if states.iter().any(|s| s.is_pausable()) {
        None
    } else {
        Some(RunState::Paused)
    }
}

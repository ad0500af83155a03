//! Supervisor端：触发计算、路由派发、实例生命周期管理与后台扫描

pub mod job_manager;
pub mod recovery_service;
pub mod rpc_service;
pub mod scheduler;
pub mod strategies;
pub mod supervisor;
pub mod task_dispatcher;
pub mod trigger;

pub use job_manager::{JobManager, JobManagerConfig};
pub use recovery_service::{RecoveryConfig, RunningInstanceScanner, WaitingInstanceScanner};
pub use rpc_service::SupervisorRpcService;
pub use scheduler::{TriggeringJobScanner, TriggeringJobScannerConfig};
pub use strategies::WorkerRouter;
pub use supervisor::{ScannerLocks, SupervisorDeps, SupervisorNode};
pub use task_dispatcher::{DispatchFailedEvent, LocalTarget, TaskDispatcher, TaskDispatcherConfig};
pub use trigger::{compute_next_trigger_time, TriggerCalculator};

pub mod handler;
pub mod lock;
pub mod registry;
pub mod repository;
pub mod rpc;

pub use handler::{ExecuteResult, ExecutionContext, JobHandler};
pub use lock::DistributedLock;
pub use registry::{Discovery, Registry};
pub use repository::{InstanceRepository, JobRepository, TaskRepository, TriggeredInstance};
pub use rpc::{SupervisorRpc, TaskTransport, WorkerRpc};

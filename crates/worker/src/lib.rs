pub mod handler_registry;
pub mod handlers;
pub mod pool;
pub mod rpc_service;
pub mod runner;
pub mod service;

#[cfg(test)]
mod test_utils;

pub use handler_registry::{HandlerRegistry, HTTP_HANDLER, SHELL_HANDLER};
pub use handlers::{HttpHandler, HttpTaskParams, ShellHandler, ShellTaskParams};
pub use pool::{WorkerPoolConfig, WorkerThreadPool};
pub use rpc_service::WorkerRpcService;
pub use runner::{StopReason, StopSignal, TaskRunner};
pub use service::{worker_identity, WorkerNode, WorkerNodeBuilder};

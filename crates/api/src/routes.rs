use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use scheduler_core::traits::{SupervisorRpc, TaskTransport, WorkerRpc};

use crate::handlers::{health::health_check, supervisor, worker};
use crate::middleware::{request_logging, trace_layer};
use crate::types::paths;

/// Supervisor端RPC路由
pub fn supervisor_routes(rpc: Arc<dyn SupervisorRpc>) -> Router {
    Router::new()
        .route(paths::SUPERVISOR_GET_TASK, post(supervisor::get_task))
        .route(paths::SUPERVISOR_START_TASK, post(supervisor::start_task))
        .route(paths::SUPERVISOR_STOP_TASK, post(supervisor::stop_task))
        .route(paths::SUPERVISOR_SAVEPOINT, post(supervisor::savepoint))
        .route(paths::SUPERVISOR_TRIGGER_JOB, post(supervisor::trigger_job))
        .route(
            paths::SUPERVISOR_PAUSE_INSTANCE,
            post(supervisor::pause_instance),
        )
        .route(
            paths::SUPERVISOR_CANCEL_INSTANCE,
            post(supervisor::cancel_instance),
        )
        .route(
            paths::SUPERVISOR_RESUME_INSTANCE,
            post(supervisor::resume_instance),
        )
        .with_state(rpc)
}

/// Worker端RPC路由
pub fn worker_routes(rpc: Arc<dyn WorkerRpc>, receiver: Arc<dyn TaskTransport>) -> Router {
    Router::new()
        .route(paths::WORKER_VERIFY, post(worker::verify))
        .route(paths::WORKER_SPLIT, post(worker::split))
        .route(paths::WORKER_DISPATCH, post(worker::dispatch))
        .with_state(worker::WorkerState { rpc, receiver })
}

/// 加上健康检查和通用中间件
pub fn create_app(routes: Router) -> Router {
    routes.route(paths::HEALTH, get(health_check)).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}

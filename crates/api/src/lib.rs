//! # Scheduler API
//!
//! Supervisor与Worker之间的HTTP RPC层。
//!
//! - 服务端：[`routes::supervisor_routes`]和[`routes::worker_routes`]把RPC trait暴露为axum路由，
//!   [`routes::create_app`]再加上`/health`和请求日志中间件。
//! - 客户端：[`client`]中的实现同样基于这些trait，Supervisor侧使用[`HttpWorkerRpc`]和
//!   [`HttpTaskTransport`]，Worker侧使用[`HttpSupervisorRpc`]。
//!
//! 所有接口都是`POST` + JSON，成功响应统一为`{"success":true,"data":...}`，
//! 失败响应为`{"success":false,"code":...,"message":...}`，HTTP状态码由
//! `SchedulerError::status_code`决定。客户端只对超时、409/423/425/429以及5xx换节点重试。

pub mod client;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod types;

pub use client::{HttpSupervisorRpc, HttpTaskTransport, HttpWorkerRpc, RetryPolicy, RpcClient};
pub use error::{ApiError, ApiResult};
pub use routes::{create_app, supervisor_routes, worker_routes};
pub use types::paths;

/// 在已绑定的监听器上提供服务，直到`shutdown`完成
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    tracing::info!("HTTP服务监听: {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

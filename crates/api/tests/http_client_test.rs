mod common;

use std::sync::Arc;

use common::{FakeSupervisor, FakeWorker};
use scheduler_api::{HttpSupervisorRpc, HttpTaskTransport, HttpWorkerRpc, RpcClient};
use scheduler_core::{
    config::HttpConfig,
    models::{ExecuteState, Operation, StopTaskParam, Supervisor, Worker},
    traits::{Registry, SupervisorRpc, TaskTransport, WorkerRpc},
    SchedulerError,
};
use scheduler_infrastructure::MemoryRegistry;

fn client() -> RpcClient {
    RpcClient::new(&HttpConfig {
        connect_timeout_ms: 500,
        request_timeout_ms: 2_000,
        retry_max_count: 3,
        retry_backoff_ms: 5,
    })
    .unwrap()
}

fn worker_at(address: &str, id: &str) -> Worker {
    let (host, port) = address.rsplit_once(':').unwrap();
    Worker::new("app", id, host, port.parse().unwrap())
}

#[tokio::test]
async fn test_supervisor_rpc_skips_dead_supervisor() {
    let fake = Arc::new(FakeSupervisor::default());
    let address = common::spawn_server(common::supervisor_routes(&fake)).await;
    let (host, port) = address.rsplit_once(':').unwrap();

    let registry = Arc::new(MemoryRegistry::<Supervisor>::new());
    registry
        .register(&Supervisor::new("127.0.0.1", common::closed_port().await))
        .await
        .unwrap();
    registry
        .register(&Supervisor::new(host, port.parse().unwrap()))
        .await
        .unwrap();
    let rpc = HttpSupervisorRpc::new(client(), registry);

    for _ in 0..4 {
        assert_eq!(rpc.trigger_job(3).await.unwrap(), 300);
    }
    let task = rpc.get_task(1).await.unwrap().unwrap();
    assert_eq!(task.instance_id, 10);

    let reported = rpc
        .stop_task(&StopTaskParam {
            instance_id: 10,
            task_id: 1,
            worker: Worker::new("app", "w1", "127.0.0.1", 9000),
            operation: Operation::Trigger,
            to_state: ExecuteState::Finished,
            error_msg: None,
        })
        .await
        .unwrap();
    assert!(reported);
    assert_eq!(fake.stopped.lock().unwrap()[0].to_state, ExecuteState::Finished);
}

#[tokio::test]
async fn test_supervisor_rpc_does_not_retry_client_errors() {
    let fake = Arc::new(FakeSupervisor::default());
    let address = common::spawn_server(common::supervisor_routes(&fake)).await;
    let (host, port) = address.rsplit_once(':').unwrap();
    let registry = Arc::new(MemoryRegistry::<Supervisor>::new());
    registry
        .register(&Supervisor::new(host, port.parse().unwrap()))
        .await
        .unwrap();
    let rpc = HttpSupervisorRpc::new(client(), registry);

    let err = rpc.trigger_job(404).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Rpc { status: Some(404), .. }));
    assert!(!err.is_retriable());

    let err = rpc.pause_instance(1).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Rpc { status: Some(409), .. }));
}

#[tokio::test]
async fn test_supervisor_rpc_without_supervisors() {
    let rpc = HttpSupervisorRpc::new(client(), Arc::new(MemoryRegistry::<Supervisor>::new()));
    assert!(rpc.trigger_job(1).await.is_err());
}

#[tokio::test]
async fn test_worker_rpc_by_group() {
    let fake = Arc::new(FakeWorker::default());
    let address = common::spawn_server(common::worker_routes(&fake)).await;
    let registry = Arc::new(MemoryRegistry::<Worker>::new());
    registry.register(&worker_at(&address, "w1")).await.unwrap();
    let rpc = HttpWorkerRpc::new(client(), registry);

    assert!(rpc.verify(&common::handler_param("shell", "")).await.unwrap());
    assert!(!rpc.verify(&common::handler_param("http", "")).await.unwrap());
    assert_eq!(
        rpc.split(&common::handler_param("shell", "x,y")).await.unwrap(),
        vec!["x".to_string(), "y".to_string()]
    );

    let mut other_group = common::handler_param("shell", "");
    other_group.group = "billing".to_string();
    assert!(matches!(
        rpc.verify(&other_group).await,
        Err(SchedulerError::NoAvailableWorker { .. })
    ));
}

#[tokio::test]
async fn test_task_transport_surfaces_queue_full() {
    let fake = Arc::new(FakeWorker::default());
    let address = common::spawn_server(common::worker_routes(&fake)).await;
    let worker = worker_at(&address, "w1");
    let transport = HttpTaskTransport::new(client());

    transport
        .dispatch(&worker, &[common::execute_param(1), common::execute_param(2)])
        .await
        .unwrap();
    assert_eq!(fake.received.lock().unwrap().len(), 2);

    fake.full.store(true, std::sync::atomic::Ordering::SeqCst);
    let err = transport
        .dispatch(&worker, &[common::execute_param(3)])
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Rpc { status: Some(429), .. }));
    assert!(err.is_retriable());

    let dead = Worker::new("app", "w2", "127.0.0.1", common::closed_port().await);
    let err = transport
        .dispatch(&dead, &[common::execute_param(4)])
        .await
        .unwrap_err();
    assert!(err.is_retriable());
}

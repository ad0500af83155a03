mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{worker, Harness};
use scheduler_core::{
    heartbeat::Heartbeat,
    models::{
        now_millis, ExecuteState, Instance, Job, JobState, Operation, RetryType, RouteStrategy,
        RunState, RunType, StartTaskParam, StopTaskParam, Task, TriggerType, AWAITING_COMPLETION,
    },
    traits::{InstanceRepository, JobRepository, Registry, TaskRepository, TriggeredInstance},
    SchedulerError,
};

fn cron_job() -> Job {
    Job::new("app", "report", "echo", TriggerType::Cron, "0 0 1 * * ?")
}

#[tokio::test]
async fn test_add_job_computes_first_trigger_time() {
    let h = Harness::new(&[worker(1)]).await;
    let job_id = h.manager.add_job(cron_job()).await.unwrap();
    let job = h.job(job_id).await;
    assert_eq!(job.job_state, JobState::Enable);
    assert!(job.next_trigger_time.is_some());
    assert!(job.last_trigger_time.is_none());
}

#[tokio::test]
async fn test_add_job_rejects_invalid_definitions() {
    let h = Harness::new(&[worker(1)]).await;

    let bad_cron = Job::new("app", "bad", "echo", TriggerType::Cron, "not a cron");
    assert!(h.manager.add_job(bad_cron).await.is_err());

    let mut expired = Job::new("app", "expired", "echo", TriggerType::FixedRate, "1000");
    expired.end_time = Some(1_000);
    assert!(h.manager.add_job(expired).await.is_err());

    let mut too_many_retries = cron_job();
    too_many_retries.retry_type = RetryType::All;
    too_many_retries.retry_count = 100;
    assert!(h.manager.add_job(too_many_retries).await.is_err());

    h.worker_rpc
        .valid
        .store(false, Ordering::SeqCst);
    assert!(h.manager.add_job(cron_job()).await.is_err());
}

#[tokio::test]
async fn test_add_depend_job_requires_parent_in_same_group() {
    let h = Harness::new(&[worker(1)]).await;
    let parent_id = h.manager.add_job(cron_job()).await.unwrap();

    let child = Job::new("app", "child", "echo", TriggerType::Depend, parent_id.to_string());
    let child_id = h.manager.add_job(child).await.unwrap();
    assert_eq!(h.job(child_id).await.next_trigger_time, None);

    let missing = Job::new("app", "orphan", "echo", TriggerType::Depend, "42");
    assert!(matches!(
        h.manager.add_job(missing).await,
        Err(SchedulerError::JobNotFound { id: 42 })
    ));

    let other_group = Job::new("other", "child", "echo", TriggerType::Depend, parent_id.to_string());
    assert!(h.manager.add_job(other_group).await.is_err());
}

#[tokio::test]
async fn test_manual_trigger_runs_to_finished() {
    let h = Harness::new(&[worker(1), worker(2)]).await;
    h.worker_rpc
        .shards
        .store(3, Ordering::SeqCst);
    let job_id = h.manager.add_job(cron_job()).await.unwrap();

    let instance_id = h.manager.trigger_job(job_id).await.unwrap();
    assert_eq!(h.transport.sent().len(), 3);

    assert_eq!(h.execute_sent(ExecuteState::Finished).await, 3);
    let instance = InstanceRepository::get(h.store.as_ref(), instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.run_type, RunType::Manual);
    assert_eq!(instance.run_state, RunState::Finished);
    assert!(instance.run_end_time.is_some());
}

#[tokio::test]
async fn test_start_task_rejects_second_worker() {
    let h = Harness::new(&[worker(1), worker(2)]).await;
    let job_id = h.manager.add_job(cron_job()).await.unwrap();
    let instance_id = h.manager.trigger_job(job_id).await.unwrap();
    let (_, param) = h.transport.sent().remove(0);

    let mut start = StartTaskParam {
        job_id,
        instance_id,
        task_id: param.task_id,
        worker: worker(1),
        start_time: 0,
    };
    assert!(h.manager.start_task(&start).await.unwrap().is_some());
    start.worker = worker(2);
    assert!(h.manager.start_task(&start).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_instance_is_retried() {
    let h = Harness::new(&[worker(1)]).await;
    let mut job = cron_job();
    job.retry_type = RetryType::Failed;
    job.retry_count = 1;
    job.retry_interval_ms = 0;
    let job_id = h.manager.add_job(job).await.unwrap();
    let instance_id = h.manager.trigger_job(job_id).await.unwrap();

    assert_eq!(h.execute_sent(ExecuteState::ExecuteFailed).await, 1);
    let instances = h.store.instances_of(job_id).await;
    assert_eq!(instances.len(), 2);
    let retry = instances
        .iter()
        .find(|i| i.run_type == RunType::Retry)
        .unwrap();
    assert_eq!(retry.retried_count, 1);
    assert_eq!(retry.parent_instance_id, Some(instance_id));
    assert_eq!(retry.root_instance_id, Some(instance_id));

    // 重试实例再次失败后不再重试
    assert_eq!(h.execute_sent(ExecuteState::ExecuteFailed).await, 1);
    let instances = h.store.instances_of(job_id).await;
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.run_state == RunState::Canceled));
}

#[tokio::test]
async fn test_retry_split_does_not_hold_instance_lock() {
    let h = Harness::new(&[worker(1)]).await;
    let mut job = cron_job();
    job.retry_type = RetryType::All;
    job.retry_count = 1;
    let job_id = h.manager.add_job(job).await.unwrap();
    let instance_id = h.manager.trigger_job(job_id).await.unwrap();
    let (_, param) = h.transport.sent().remove(0);
    let start = StartTaskParam {
        job_id,
        instance_id,
        task_id: param.task_id,
        worker: worker(1),
        start_time: now_millis(),
    };
    assert!(h.manager.start_task(&start).await.unwrap().is_some());

    // 同一把分段锁上的另一个实例
    let now = now_millis();
    let neighbour_id = instance_id + 64;
    let neighbour_task_id = neighbour_id + 1;
    let neighbour = TriggeredInstance {
        instance: Instance::create(neighbour_id, job_id, RunType::Manual, now, 0, now),
        tasks: vec![Task::create(
            neighbour_task_id,
            neighbour_id,
            0,
            1,
            String::new(),
            None,
            now,
        )],
    };
    InstanceRepository::insert(h.store.as_ref(), &neighbour)
        .await
        .unwrap();

    h.worker_rpc.hold_split.store(true, Ordering::SeqCst);
    let manager = h.manager.clone();
    let stop = StopTaskParam {
        instance_id,
        task_id: param.task_id,
        worker: worker(1),
        operation: Operation::Trigger,
        to_state: ExecuteState::ExecuteFailed,
        error_msg: Some("boom".to_string()),
    };
    let stopping = tokio::spawn(async move { manager.stop_task(&stop).await });
    tokio::time::timeout(Duration::from_secs(5), h.worker_rpc.split_entered.notified())
        .await
        .expect("重试未调用拆分");

    let neighbour_start = StartTaskParam {
        job_id,
        instance_id: neighbour_id,
        task_id: neighbour_task_id,
        worker: worker(1),
        start_time: now_millis(),
    };
    let started = tokio::time::timeout(
        Duration::from_secs(1),
        h.manager.start_task(&neighbour_start),
    )
    .await
    .expect("拆分期间实例锁仍被占用")
    .unwrap();
    assert!(started.is_some());

    h.worker_rpc.release_split.notify_one();
    assert!(stopping.await.unwrap().unwrap());
    let instances = h.store.instances_of(job_id).await;
    assert!(instances.iter().any(|i| i.run_type == RunType::Retry));
}

#[tokio::test]
async fn test_broadcast_dead_worker_task_is_canceled() {
    let mut h = Harness::new(&[worker(1), worker(2), worker(3)]).await;
    let mut job = cron_job();
    job.route_strategy = RouteStrategy::Broadcast;
    let job_id = h.manager.add_job(job).await.unwrap();
    let job = h.job(job_id).await;

    let now = now_millis();
    let triggered = h
        .manager
        .create_triggered(&job, RunType::Manual, now - 1_000, now)
        .await
        .unwrap();
    assert_eq!(triggered.tasks.len(), 3);
    InstanceRepository::insert(h.store.as_ref(), &triggered)
        .await
        .unwrap();
    h.registry.deregister(&worker(2)).await.unwrap();

    h.manager
        .dispatch(&job, &triggered.instance, &triggered.tasks)
        .await;
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(w, _)| *w != worker(2)));

    let event = h.events.try_recv().unwrap();
    assert_eq!(event.execute_state, ExecuteState::WaitingCanceled);
    h.manager.process_dispatch_failed(event).await.unwrap();

    assert_eq!(h.execute_sent(ExecuteState::Finished).await, 2);
    let instance = InstanceRepository::get(h.store.as_ref(), triggered.instance.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.run_state, RunState::Canceled);
}

#[tokio::test]
async fn test_pause_and_resume_waiting_instance() {
    let h = Harness::new(&[worker(1)]).await;
    let job_id = h.manager.add_job(cron_job()).await.unwrap();
    let instance_id = h.manager.trigger_job(job_id).await.unwrap();

    assert!(h.manager.pause_instance(instance_id).await.unwrap());
    let instance = InstanceRepository::get(h.store.as_ref(), instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.run_state, RunState::Paused);
    let tasks = h.store.find_by_instance(instance_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.execute_state == ExecuteState::Paused));

    assert!(h.manager.resume_instance(instance_id).await.unwrap());
    let tasks = h.store.find_by_instance(instance_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.execute_state == ExecuteState::Waiting));
    // 恢复后重新派发
    assert_eq!(h.transport.sent().len(), 2);
    assert!(!h.manager.resume_instance(instance_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_executing_instance_sends_operation() {
    let h = Harness::new(&[worker(1)]).await;
    let job_id = h.manager.add_job(cron_job()).await.unwrap();
    let instance_id = h.manager.trigger_job(job_id).await.unwrap();
    let (w, param) = h.transport.sent().remove(0);
    h.manager
        .start_task(&StartTaskParam {
            job_id,
            instance_id,
            task_id: param.task_id,
            worker: w.clone(),
            start_time: 0,
        })
        .await
        .unwrap();

    assert!(h
        .manager
        .cancel_instance(instance_id, Operation::ManualCancel)
        .await
        .unwrap());
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1.operation, Operation::ManualCancel);

    // Worker确认取消后实例结束
    let stop = StopTaskParam {
        instance_id,
        task_id: param.task_id,
        worker: w,
        operation: Operation::ManualCancel,
        to_state: ExecuteState::ManualCanceled,
        error_msg: None,
    };
    assert!(h.manager.stop_task(&stop).await.unwrap());
    let instance = InstanceRepository::get(h.store.as_ref(), instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.run_state, RunState::Canceled);
    assert!(matches!(
        h.manager.cancel_instance(instance_id, Operation::Pause).await,
        Err(SchedulerError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_worker_shutdown_returns_task_to_waiting() {
    let h = Harness::new(&[worker(1)]).await;
    let job_id = h.manager.add_job(cron_job()).await.unwrap();
    let instance_id = h.manager.trigger_job(job_id).await.unwrap();
    let (w, param) = h.transport.sent().remove(0);
    h.manager
        .start_task(&StartTaskParam {
            job_id,
            instance_id,
            task_id: param.task_id,
            worker: w.clone(),
            start_time: 0,
        })
        .await
        .unwrap();
    let before = now_millis();

    let stop = StopTaskParam {
        instance_id,
        task_id: param.task_id,
        worker: w,
        operation: Operation::Pause,
        to_state: ExecuteState::Waiting,
        error_msg: None,
    };
    assert!(h.manager.stop_task(&stop).await.unwrap());
    let task = TaskRepository::get(h.store.as_ref(), param.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.execute_state, ExecuteState::Waiting);
    let instance = InstanceRepository::get(h.store.as_ref(), instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.run_state, RunState::Running);
    assert!(instance.next_scan_time >= before + 30_000);
}

#[tokio::test]
async fn test_fixed_delay_next_time_after_completion() {
    let h = Harness::new(&[worker(1)]).await;
    let job = Job::new("app", "delay", "echo", TriggerType::FixedDelay, "5000");
    let job_id = h.add_due_job(job).await;

    h.triggering_scanner().heartbeat().await.unwrap();
    assert_eq!(h.job(job_id).await.next_trigger_time, Some(AWAITING_COMPLETION));

    assert_eq!(h.execute_sent(ExecuteState::Finished).await, 1);
    let job = h.job(job_id).await;
    let instance = h.store.instances_of(job_id).await.remove(0);
    let end = instance.run_end_time.unwrap();
    assert_eq!(job.next_trigger_time, Some(end + 5_000));
}

#[tokio::test]
async fn test_depend_child_fires_after_parent_finished() {
    let h = Harness::new(&[worker(1)]).await;
    let parent_id = h.manager.add_job(cron_job()).await.unwrap();
    let child = Job::new("app", "child", "echo", TriggerType::Depend, parent_id.to_string());
    let child_id = h.manager.add_job(child).await.unwrap();
    assert_eq!(h.store.find_dependents(parent_id).await.unwrap().len(), 1);

    h.manager.trigger_job(parent_id).await.unwrap();
    // 手动触发的父实例同样带动子任务
    assert_eq!(h.execute_sent(ExecuteState::Finished).await, 1);

    let children = h.store.instances_of(child_id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].run_type, RunType::Depend);
    assert!(h.job(child_id).await.last_trigger_time.is_some());
    assert_eq!(h.transport.sent().len(), 2);
}

#[tokio::test]
async fn test_change_job_state() {
    let h = Harness::new(&[worker(1)]).await;
    let job_id = h.manager.add_job(cron_job()).await.unwrap();
    assert!(h
        .manager
        .change_job_state(job_id, JobState::Disable)
        .await
        .unwrap());
    let job = h.job(job_id).await;
    assert_eq!(job.job_state, JobState::Disable);

    assert!(h
        .manager
        .change_job_state(job_id, JobState::Enable)
        .await
        .unwrap());
    let job = h.job(job_id).await;
    assert_eq!(job.job_state, JobState::Enable);
    assert!(job.next_trigger_time.is_some());
}

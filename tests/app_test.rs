use std::time::Duration;

use scheduler::{AppMode, Application};
use scheduler_core::config::{AppConfig, JobSeedConfig};
use scheduler_core::models::{RunState, TriggerType};

fn local_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.supervisor.bind_address = "127.0.0.1:0".to_string();
    config.supervisor.scan_triggering_job_period_ms = 1000;
    config.supervisor.scan_waiting_instance_period_ms = 1000;
    config.supervisor.scan_running_instance_period_ms = 1000;
    config.worker.bind_address = "127.0.0.1:0".to_string();
    config.worker.worker_id = Some("app-test".to_string());
    config.observability.prometheus_address = None;
    config
}

fn echo_job() -> JobSeedConfig {
    JobSeedConfig {
        group: "default".to_string(),
        job_name: "echo".to_string(),
        job_handler: "shell".to_string(),
        job_param: "echo hi".to_string(),
        trigger_type: TriggerType::FixedRate,
        trigger_value: "1000".to_string(),
        route_strategy: None,
        collided_strategy: None,
        misfire_strategy: None,
        retry_type: None,
        retry_count: 0,
        retry_interval_ms: 0,
        execute_timeout_ms: 0,
    }
}

#[tokio::test]
async fn test_all_mode_runs_seeded_job() {
    let mut config = local_config();
    config.jobs.push(echo_job());

    let app = Application::new(config, AppMode::All)
        .start()
        .await
        .expect("启动失败");
    assert_eq!(app.mode(), AppMode::All);
    assert_eq!(app.addresses().len(), 2);
    assert!(app.supervisor().is_some());
    assert!(app.worker().is_some());

    let store = app.store().expect("缺少存储").clone();
    let jobs = store.jobs().await;
    assert_eq!(jobs.len(), 1);
    let job_id = jobs[0].job_id;

    let mut finished = false;
    for _ in 0..80 {
        let instances = store.instances_of(job_id).await;
        if instances.iter().any(|i| i.run_state == RunState::Finished) {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tokio::time::timeout(Duration::from_secs(15), app.stop())
        .await
        .expect("关闭超时");
    assert!(finished, "任务实例未在期限内完成");
}

#[tokio::test]
async fn test_invalid_seed_is_skipped() {
    let mut config = local_config();
    let mut bad = echo_job();
    bad.trigger_value = "not-a-number".to_string();
    config.jobs.push(bad);

    let app = Application::new(config, AppMode::All)
        .start()
        .await
        .expect("启动失败");
    let store = app.store().expect("缺少存储").clone();
    assert!(store.jobs().await.is_empty());
    app.stop().await;
}

#[tokio::test]
async fn test_split_mode_requires_shared_registry() {
    for mode in [AppMode::Worker, AppMode::Supervisor] {
        let result = Application::new(local_config(), mode).start().await;
        assert!(result.is_err());
    }
}

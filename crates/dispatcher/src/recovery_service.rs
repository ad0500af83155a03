use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    heartbeat::Heartbeat,
    models::{now_millis, ExecuteState, Instance, RunState, Task},
    traits::DistributedLock,
    SchedulerResult,
};

use crate::job_manager::JobManager;

/// 实例恢复扫描配置
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub period_ms: u64,
    pub batch_size: usize,
    /// 实例多少个周期未更新视为过期
    pub expire_periods: i64,
}

impl RecoveryConfig {
    pub fn waiting(period_ms: u64, batch_size: usize) -> Self {
        Self {
            period_ms,
            batch_size,
            expire_periods: 12,
        }
    }

    pub fn running(period_ms: u64, batch_size: usize) -> Self {
        Self {
            period_ms,
            batch_size,
            expire_periods: 8,
        }
    }

    fn expire_ms(&self) -> i64 {
        self.period_ms as i64 * self.expire_periods
    }
}

/// 过期实例的恢复逻辑，由等待实例与运行实例两个扫描器共用
struct InstanceRecovery {
    manager: Arc<JobManager>,
    lock: Arc<dyn DistributedLock>,
    run_state: RunState,
    config: RecoveryConfig,
}

impl InstanceRecovery {
    async fn heartbeat(&self) -> SchedulerResult<bool> {
        if !self.manager.has_discovered_workers() {
            debug!("没有可用的Worker，跳过{}实例扫描", self.run_state);
            return Ok(true);
        }
        if !self.lock.try_lock().await? {
            return Ok(true);
        }
        let result = self.scan().await;
        if let Err(e) = self.lock.unlock().await {
            warn!("释放锁失败 {}: {}", self.lock.name(), e);
        }
        result
    }

    async fn scan(&self) -> SchedulerResult<bool> {
        let now = now_millis();
        let expire_time = now - self.config.expire_ms();
        let instances = self
            .manager
            .instance_repo()
            .find_expired(self.run_state, expire_time, self.config.batch_size)
            .await?;
        if instances.is_empty() {
            return Ok(true);
        }
        debug!("扫描到{}个过期的{}实例", instances.len(), self.run_state);
        let drained = instances.len() < self.config.batch_size;
        for instance in instances {
            let instance_id = instance.instance_id;
            if let Err(e) = self.recover(instance, now, expire_time).await {
                error!("恢复实例 {} 失败: {}", instance_id, e);
            }
        }
        Ok(drained)
    }

    async fn recover(&self, instance: Instance, now: i64, expire_time: i64) -> SchedulerResult<()> {
        // 抢占本轮处理权
        if !self
            .manager
            .update_instance_next_scan_time(&instance, now)
            .await?
        {
            debug!("实例 {} 已被其它扫描处理", instance.instance_id);
            return Ok(());
        }
        let tasks = self
            .manager
            .task_repo()
            .find_by_instance(instance.instance_id)
            .await?;

        let redispatch: Vec<Task> = tasks
            .iter()
            .filter(|t| t.execute_state == ExecuteState::Waiting)
            .filter(|t| {
                !self.manager.is_alive_worker(t.worker.as_ref()) || t.update_time < expire_time
            })
            .cloned()
            .collect();
        let has_waiting = tasks
            .iter()
            .any(|t| t.execute_state == ExecuteState::Waiting);

        if !redispatch.is_empty() {
            let Some(job) = self.manager.job_repo().get(instance.job_id).await? else {
                warn!("实例所属任务不存在，清理实例: {}", instance.instance_id);
                self.purge_waiting(&instance, &redispatch).await?;
                return Ok(());
            };
            counter!("scheduler_instance_recovered_total", "state" => self.run_state.to_string())
                .increment(1);
            self.manager.redispatch(&job, &instance, &redispatch).await;
            return Ok(());
        }
        if has_waiting || self.manager.has_alive_executing(&tasks) {
            return Ok(());
        }
        info!("实例 {} 已没有存活的执行者", instance.instance_id);
        self.manager.purge_instance(&instance).await?;
        Ok(())
    }

    /// 任务定义已被删除时直接取消剩余的等待任务
    async fn purge_waiting(&self, instance: &Instance, tasks: &[Task]) -> SchedulerResult<()> {
        let now = now_millis();
        for task in tasks {
            self.manager
                .task_repo()
                .terminate(
                    task.task_id,
                    None,
                    ExecuteState::WaitingCanceled,
                    ExecuteState::Waiting,
                    Some(now),
                    None,
                )
                .await?;
        }
        self.manager.purge_instance(instance).await?;
        Ok(())
    }
}

/// 扫描长时间处于WAITING的实例：重新派发未送达或已失去Worker的任务
pub struct WaitingInstanceScanner {
    inner: InstanceRecovery,
}

impl WaitingInstanceScanner {
    pub fn new(
        manager: Arc<JobManager>,
        lock: Arc<dyn DistributedLock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            inner: InstanceRecovery {
                manager,
                lock,
                run_state: RunState::Waiting,
                config,
            },
        }
    }
}

#[async_trait]
impl Heartbeat for WaitingInstanceScanner {
    fn name(&self) -> &str {
        "waiting-instance-scanner"
    }

    async fn heartbeat(&self) -> SchedulerResult<bool> {
        self.inner.heartbeat().await
    }
}

/// 扫描长时间处于RUNNING的实例：Worker下线后重新派发或清理实例
pub struct RunningInstanceScanner {
    inner: InstanceRecovery,
}

impl RunningInstanceScanner {
    pub fn new(
        manager: Arc<JobManager>,
        lock: Arc<dyn DistributedLock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            inner: InstanceRecovery {
                manager,
                lock,
                run_state: RunState::Running,
                config,
            },
        }
    }
}

#[async_trait]
impl Heartbeat for RunningInstanceScanner {
    fn name(&self) -> &str {
        "running-instance-scanner"
    }

    async fn heartbeat(&self) -> SchedulerResult<bool> {
        self.inner.heartbeat().await
    }
}

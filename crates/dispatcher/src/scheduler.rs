use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use metrics::counter;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    heartbeat::{panic_message, Heartbeat},
    models::{
        now_millis, truncate_text, CollidedStrategy, Job, JobState, MisfireStrategy, Operation, RunType,
        TriggerType, AWAITING_COMPLETION,
    },
    traits::DistributedLock,
    SchedulerError, SchedulerResult,
};

use crate::job_manager::JobManager;
use crate::trigger::compute_next_trigger_time;

/// 分组没有存活Worker时推迟扫描的时间
const NO_WORKER_DELAY_MS: i64 = 60_000;
/// SERIAL策略下上一次实例未结束时推迟扫描的时间
const SERIAL_DELAY_MS: i64 = 30_000;
/// OVERRIDE策略取消上一次实例后推迟扫描的时间
const OVERRIDE_DELAY_MS: i64 = 3_000;
/// 扫描失败的退避基数
const FAILED_BACKOFF_MS: i64 = 5_000;

#[derive(Debug, Clone)]
pub struct TriggeringJobScannerConfig {
    pub period_ms: u64,
    pub batch_size: usize,
    pub process_concurrency: usize,
    pub max_scan_failed_count: u32,
}

impl Default for TriggeringJobScannerConfig {
    fn default() -> Self {
        Self {
            period_ms: 3_000, // 3秒
            batch_size: 200,
            process_concurrency: 16,
            max_scan_failed_count: 5,
        }
    }
}

/// 扫描即将到期的任务并创建调度实例
///
/// 每轮扫描`next_trigger_time < now + 3个周期`的任务，提前量内的触发由派发器的时间轮延迟执行。
pub struct TriggeringJobScanner {
    manager: Arc<JobManager>,
    lock: Arc<dyn DistributedLock>,
    config: TriggeringJobScannerConfig,
}

impl TriggeringJobScanner {
    pub fn new(
        manager: Arc<JobManager>,
        lock: Arc<dyn DistributedLock>,
        config: Option<TriggeringJobScannerConfig>,
    ) -> Self {
        Self {
            manager,
            lock,
            config: config.unwrap_or_default(),
        }
    }

    fn lookahead_ms(&self) -> i64 {
        self.config.period_ms as i64 * 3
    }

    async fn scan(&self) -> SchedulerResult<bool> {
        let now = now_millis();
        let max_next = now + self.lookahead_ms();
        let jobs = self
            .manager
            .job_repo()
            .find_due(max_next, now, self.config.batch_size)
            .await?;
        if jobs.is_empty() {
            return Ok(true);
        }
        debug!("扫描到{}个待触发任务", jobs.len());
        let drained = jobs.len() < self.config.batch_size;

        stream::iter(jobs)
            .for_each_concurrent(self.config.process_concurrency.max(1), |job| async move {
                let job_id = job.job_id;
                // 单个任务panic不能中断整轮扫描，按普通失败退避
                let result = match AssertUnwindSafe(self.process(job.clone(), now, max_next))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => Err(SchedulerError::Internal(format!(
                        "处理任务时panic: {}",
                        panic_message(&*panic)
                    ))),
                };
                if let Err(e) = result {
                    if let Err(e2) = self.handle_failure(job, e).await {
                        error!("处理任务扫描失败时出错 {}: {}", job_id, e2);
                    }
                }
            })
            .await;
        Ok(drained)
    }

    async fn process(&self, mut job: Job, now: i64, max_next: i64) -> SchedulerResult<()> {
        if !self.manager.has_discovered_group(&job.group) {
            warn!("分组没有可用的Worker，推迟扫描: {}, {}", job.group, job.job_id);
            self.manager
                .job_repo()
                .update_next_scan_time(
                    job.job_id,
                    job.version,
                    now + NO_WORKER_DELAY_MS,
                    job.scan_failed_count,
                )
                .await?;
            return Ok(());
        }

        let Some(trigger_time) = self.recompute_trigger_time(&job, now)? else {
            self.manager
                .disable_job(&job, "任务已没有下次触发时间")
                .await?;
            return Ok(());
        };
        if job.last_trigger_time.is_some_and(|last| last >= trigger_time) {
            return Err(SchedulerError::InvalidJobParam(format!(
                "触发时间必须晚于上次触发时间: {trigger_time}"
            )));
        }
        if trigger_time > max_next {
            job.next_trigger_time = Some(trigger_time);
            self.manager.job_repo().update_trigger_time(&job).await?;
            return Ok(());
        }

        if self.check_collided(&mut job, now).await? {
            return Ok(());
        }

        job.last_trigger_time = Some(trigger_time);
        job.scan_failed_count = 0;
        job.next_trigger_time = if job.trigger_type == TriggerType::FixedDelay {
            Some(AWAITING_COMPLETION)
        } else {
            compute_next_trigger_time(&job, now)?
        };
        if job.next_trigger_time.is_none() {
            job.job_state = JobState::Disable;
            job.remark = Some("任务已没有下次触发时间".to_string());
        }

        let triggered = self
            .manager
            .create_triggered(&job, RunType::Schedule, trigger_time, now)
            .await?;
        if !self
            .manager
            .job_repo()
            .commit_trigger(&job, &triggered)
            .await?
        {
            debug!("任务 {} 已被其它进程触发", job.job_id);
            return Ok(());
        }
        counter!("scheduler_instance_triggered_total", "run_type" => RunType::Schedule.name())
            .increment(1);
        info!(
            "触发任务 {}: instance_id={}, trigger_time={}",
            job.job_id, triggered.instance.instance_id, trigger_time
        );
        self.manager
            .dispatch(&job, &triggered.instance, &triggered.tasks)
            .await;
        Ok(())
    }

    /// 本次扫描的触发时间；过期太久的按错过触发策略重新计算
    fn recompute_trigger_time(&self, job: &Job, now: i64) -> SchedulerResult<Option<i64>> {
        let Some(next) = job.next_trigger_time else {
            return Ok(None);
        };
        let fixed = matches!(
            job.trigger_type,
            TriggerType::FixedRate | TriggerType::FixedDelay
        );
        if fixed || now <= next + self.lookahead_ms() {
            return Ok(Some(next));
        }
        debug!("任务 {} 错过了触发时间: {}", job.job_id, next);
        compute_next_trigger_time(job, now)
    }

    /// 上一次调度实例仍在运行时按冲突策略处理，返回true表示本次不再触发
    async fn check_collided(&self, job: &mut Job, now: i64) -> SchedulerResult<bool> {
        if job.collided_strategy == CollidedStrategy::Concurrent {
            return Ok(false);
        }
        let Some(last) = job.last_trigger_time else {
            return Ok(false);
        };
        let Some(prev) = self
            .manager
            .instance_repo()
            .find_by_trigger(job.job_id, last, RunType::Schedule)
            .await?
        else {
            return Ok(false);
        };
        // 重试实例也算在上一次调度内
        let mut running: Vec<i64> = self
            .manager
            .instance_repo()
            .find_by_root(prev.instance_id)
            .await?
            .iter()
            .filter(|i| !i.is_terminal())
            .map(|i| i.instance_id)
            .collect();
        if !prev.is_terminal() && !running.contains(&prev.instance_id) {
            running.push(prev.instance_id);
        }
        if running.is_empty() {
            return Ok(false);
        }

        counter!("scheduler_trigger_collided_total", "strategy" => job.collided_strategy.name())
            .increment(1);
        match job.collided_strategy {
            CollidedStrategy::Discard => {
                let mut discard = job.clone();
                discard.misfire_strategy = MisfireStrategy::Discard;
                job.next_trigger_time = compute_next_trigger_time(&discard, now)?;
                if job.next_trigger_time.is_none() {
                    job.job_state = JobState::Disable;
                    job.remark = Some("任务已没有下次触发时间".to_string());
                }
                info!("上一次实例未结束，丢弃本次触发: {}", job.job_id);
                self.manager.job_repo().update_trigger_time(job).await?;
                Ok(true)
            }
            CollidedStrategy::Serial => {
                info!("上一次实例未结束，推迟触发: {}", job.job_id);
                self.manager
                    .job_repo()
                    .update_next_scan_time(
                        job.job_id,
                        job.version,
                        now + SERIAL_DELAY_MS,
                        job.scan_failed_count,
                    )
                    .await?;
                Ok(true)
            }
            CollidedStrategy::Override => {
                for instance_id in running {
                    info!("上一次实例未结束，取消上一次实例: {}", instance_id);
                    self.manager
                        .cancel_instance(instance_id, Operation::CollidedCancel)
                        .await?;
                }
                // 等待取消指令送达后再触发
                self.manager
                    .job_repo()
                    .update_next_scan_time(
                        job.job_id,
                        job.version,
                        now + OVERRIDE_DELAY_MS,
                        job.scan_failed_count,
                    )
                    .await?;
                Ok(true)
            }
            CollidedStrategy::Concurrent => Ok(false),
        }
    }

    async fn handle_failure(&self, mut job: Job, err: SchedulerError) -> SchedulerResult<()> {
        if let SchedulerError::DuplicateKey(msg) = &err {
            // 实例已存在，说明本次触发已完成，只需推进游标
            warn!("任务 {} 重复触发: {}", job.job_id, msg);
            let now = now_millis();
            if let Some(next) = job.next_trigger_time {
                job.last_trigger_time = Some(next);
                job.next_trigger_time = compute_next_trigger_time(&job, now)?;
                self.manager.job_repo().update_trigger_time(&job).await?;
            }
            return Ok(());
        }
        if err.is_definition_error() {
            let remark = truncate_text(&format!("任务配置错误: {err}"), 255);
            self.manager.disable_job(&job, &remark).await?;
            return Ok(());
        }

        let failed_count = job.scan_failed_count + 1;
        counter!("scheduler_scan_failed_total").increment(1);
        if failed_count >= self.config.max_scan_failed_count {
            error!("任务 {} 连续扫描失败{}次: {}", job.job_id, failed_count, err);
            let remark = truncate_text(&format!("连续扫描失败: {err}"), 255);
            self.manager.disable_job(&job, &remark).await?;
            return Ok(());
        }
        let delay = i64::from(failed_count * failed_count) * FAILED_BACKOFF_MS;
        warn!(
            "任务 {} 扫描失败，{}毫秒后重试: {}",
            job.job_id, delay, err
        );
        self.manager
            .job_repo()
            .update_next_scan_time(job.job_id, job.version, now_millis() + delay, failed_count)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Heartbeat for TriggeringJobScanner {
    fn name(&self) -> &str {
        "triggering-job-scanner"
    }

    async fn heartbeat(&self) -> SchedulerResult<bool> {
        if !self.manager.has_discovered_workers() {
            debug!("没有可用的Worker，跳过任务扫描");
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
}

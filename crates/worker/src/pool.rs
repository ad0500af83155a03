use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{models::ExecuteTaskParam, SchedulerError, SchedulerResult};

use crate::runner::{StopReason, StopSignal, TaskRunner};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub maximum_pool_size: usize,
    pub queue_capacity: usize,
    pub keep_alive_time_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            maximum_pool_size: 100,
            queue_capacity: 1_000,
            keep_alive_time_ms: 300_000, // 5分钟
            shutdown_timeout_ms: 10_000, // 10秒
        }
    }
}

struct Assignment {
    param: ExecuteTaskParam,
    signal: StopSignal,
}

/// 执行线程的投递端
struct ExecutionThread {
    id: usize,
    tx: mpsc::Sender<Assignment>,
}

#[derive(Default)]
struct PoolState {
    active: Mutex<HashMap<i64, StopSignal>>,
    idle: Mutex<Vec<ExecutionThread>>,
    thread_count: AtomicUsize,
    next_thread_id: AtomicUsize,
    released: Notify,
}

impl PoolState {
    fn release(&self, thread: ExecutionThread) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(thread);
        }
        self.released.notify_one();
    }

    fn take_idle(&self) -> Option<ExecutionThread> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    /// 空闲超时的线程把自己移出空闲池；已被分配任务时返回false
    fn retire_idle(&self, id: usize) -> bool {
        let Ok(mut idle) = self.idle.lock() else {
            return false;
        };
        match idle.iter().position(|t| t.id == id) {
            Some(index) => {
                idle.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn finish(&self, task_id: i64) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&task_id);
        }
    }

    fn active_signals(&self) -> Vec<StopSignal> {
        self.active
            .lock()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }

    fn active_len(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }
}

/// Worker执行线程池
///
/// TRIGGER任务进入有界队列，由boss循环取出并交给空闲执行线程（不足时在上限内新建，
/// 否则等待线程释放）。暂停与取消指令不经过队列，直接作用于活动任务。
pub struct WorkerThreadPool {
    runner: Arc<TaskRunner>,
    config: WorkerPoolConfig,
    queue_tx: mpsc::Sender<ExecuteTaskParam>,
    queue_rx: Mutex<Option<mpsc::Receiver<ExecuteTaskParam>>>,
    state: Arc<PoolState>,
    cancel: CancellationToken,
    boss: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThreadPool {
    pub fn new(runner: TaskRunner, config: Option<WorkerPoolConfig>) -> Self {
        let config = config.unwrap_or_default();
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            runner: Arc::new(runner),
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            state: Arc::new(PoolState::default()),
            cancel: CancellationToken::new(),
            boss: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// 启动boss循环，重复调用无效
    pub fn start(self: &Arc<Self>) {
        let Some(rx) = self.queue_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.run_boss(rx).await });
        if let Ok(mut boss) = self.boss.lock() {
            *boss = Some(handle);
        }
        info!(
            "Worker线程池已启动: 最大线程数={}, 队列容量={}",
            self.config.maximum_pool_size, self.config.queue_capacity
        );
    }

    /// 接收一批派发的任务；队列放不下时整批拒绝
    pub async fn submit(&self, params: Vec<ExecuteTaskParam>) -> SchedulerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::ResourceExhausted(
                "Worker线程池已关闭".to_string(),
            ));
        }
        let (triggers, operations): (Vec<_>, Vec<_>) =
            params.into_iter().partition(|p| p.operation.is_trigger());

        for param in operations {
            self.stop_task(&param).await;
        }
        if triggers.is_empty() {
            return Ok(());
        }
        if self.queue_tx.capacity() < triggers.len() {
            warn!(
                "任务队列已满，拒绝{}个任务: 剩余容量={}",
                triggers.len(),
                self.queue_tx.capacity()
            );
            return Err(SchedulerError::ResourceExhausted(format!(
                "任务队列已满: {}",
                self.config.queue_capacity
            )));
        }
        for param in triggers {
            let task_id = param.task_id;
            if let Err(e) = self.queue_tx.try_send(param) {
                warn!("任务 {} 入队失败: {}", task_id, e);
                return Err(SchedulerError::ResourceExhausted(format!(
                    "任务入队失败: {task_id}"
                )));
            }
        }
        Ok(())
    }

    /// 中断活动任务；任务不在执行时直接上报
    async fn stop_task(&self, param: &ExecuteTaskParam) {
        if !param.operation.is_stop() {
            debug!("忽略{}指令: task_id={}", param.operation, param.task_id);
            return;
        }
        let signal = self
            .state
            .active
            .lock()
            .ok()
            .and_then(|a| a.get(&param.task_id).cloned());
        match signal {
            Some(signal) => {
                info!("中断任务: task_id={}, {}", param.task_id, param.operation);
                signal.stop(StopReason::Operation(param.operation));
            }
            None => {
                debug!("任务 {} 不在执行中，直接上报{}", param.task_id, param.operation);
                self.runner.report_stopped(param).await;
            }
        }
    }

    async fn run_boss(self: Arc<Self>, mut rx: mpsc::Receiver<ExecuteTaskParam>) {
        loop {
            let param = tokio::select! {
                _ = self.cancel.cancelled() => break,
                param = rx.recv() => match param {
                    Some(param) => param,
                    None => break,
                },
            };
            let Some(thread) = self.obtain_thread().await else {
                break;
            };
            self.assign(thread, param).await;
        }
        debug!("Worker线程池boss循环已停止");
    }

    async fn obtain_thread(&self) -> Option<ExecutionThread> {
        loop {
            if let Some(thread) = self.state.take_idle() {
                return Some(thread);
            }
            if self.state.thread_count.load(Ordering::Acquire) < self.config.maximum_pool_size {
                return Some(self.spawn_thread());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.state.released.notified() => {}
            }
        }
    }

    async fn assign(&self, thread: ExecutionThread, param: ExecuteTaskParam) {
        let task_id = param.task_id;
        let signal = StopSignal::new();
        {
            let Ok(mut active) = self.state.active.lock() else {
                return;
            };
            if active.contains_key(&task_id) {
                error!("重复派发的任务，丢弃: task_id={}", task_id);
                drop(active);
                self.state.release(thread);
                return;
            }
            active.insert(task_id, signal.clone());
        }
        if thread.tx.send(Assignment { param, signal }).await.is_err() {
            warn!("执行线程已退出，任务 {} 未能执行", task_id);
            self.state.finish(task_id);
        }
    }

    fn spawn_thread(&self) -> ExecutionThread {
        let id = self.state.next_thread_id.fetch_add(1, Ordering::Relaxed);
        self.state.thread_count.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::channel(1);
        let thread = ExecutionThread { id, tx: tx.clone() };
        tokio::spawn(execution_loop(
            id,
            tx,
            rx,
            self.runner.clone(),
            self.state.clone(),
            Duration::from_millis(self.config.keep_alive_time_ms.max(1)),
            self.cancel.clone(),
        ));
        debug!("新建执行线程: {}", id);
        thread
    }

    pub fn active_count(&self) -> usize {
        self.state.active_len()
    }

    pub fn thread_count(&self) -> usize {
        self.state.thread_count.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.state.idle.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_active(&self, task_id: i64) -> bool {
        self.state
            .active
            .lock()
            .map(|a| a.contains_key(&task_id))
            .unwrap_or(false)
    }

    /// 关闭线程池
    ///
    /// 停止boss循环并中断所有活动任务，活动任务以PAUSE上报后由Supervisor重新派发。
    pub async fn close(&self) {
        info!("关闭Worker线程池，活动任务数: {}", self.active_count());
        self.cancel.cancel();
        for signal in self.state.active_signals() {
            signal.stop(StopReason::Shutdown);
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.active_count() > 0 {
            warn!("关闭线程池超时，仍有{}个任务未退出", self.active_count());
        }

        let boss = self.boss.lock().ok().and_then(|mut b| b.take());
        if let Some(boss) = boss {
            if let Err(e) = boss.await {
                error!("boss循环退出异常: {}", e);
            }
        }
        if let Ok(mut idle) = self.state.idle.lock() {
            idle.clear();
        }
        info!("Worker线程池已关闭");
    }
}

async fn execution_loop(
    id: usize,
    tx: mpsc::Sender<Assignment>,
    mut rx: mpsc::Receiver<Assignment>,
    runner: Arc<TaskRunner>,
    state: Arc<PoolState>,
    keep_alive: Duration,
    cancel: CancellationToken,
) {
    loop {
        // 已送达的任务优先于关闭信号，否则任务会一直留在活动表中
        let next = tokio::select! {
            biased;
            next = tokio::time::timeout(keep_alive, rx.recv()) => next,
            _ = cancel.cancelled() => break,
        };
        match next {
            Ok(Some(assignment)) => {
                let task_id = assignment.param.task_id;
                if cancel.is_cancelled() {
                    assignment.signal.stop(StopReason::Shutdown);
                }
                runner.run(&assignment.param, &assignment.signal).await;
                state.finish(task_id);
                if cancel.is_cancelled() {
                    break;
                }
                state.release(ExecutionThread { id, tx: tx.clone() });
            }
            Ok(None) => break,
            Err(_) => {
                if state.retire_idle(id) {
                    debug!("执行线程空闲超时退出: {}", id);
                    break;
                }
            }
        }
    }

    // 退出后才送达的任务同样以PAUSE上报
    rx.close();
    while let Ok(assignment) = rx.try_recv() {
        let task_id = assignment.param.task_id;
        debug!("执行线程 {} 退出时退回任务: {}", id, task_id);
        assignment.signal.stop(StopReason::Shutdown);
        runner.run(&assignment.param, &assignment.signal).await;
        state.finish(task_id);
    }
    state.thread_count.fetch_sub(1, Ordering::AcqRel);
    state.released.notify_one();
}

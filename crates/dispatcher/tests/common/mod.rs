#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use scheduler_core::{
    id_generator::Snowflake,
    models::{
        now_millis, ExecuteState, ExecuteTaskParam, Job, JobHandlerParam, Operation,
        StartTaskParam, StopTaskParam, Worker,
    },
    traits::{JobRepository, Registry, TaskTransport, WorkerRpc},
    SchedulerError, SchedulerResult,
};
use scheduler_dispatcher::{
    DispatchFailedEvent, JobManager, RecoveryConfig, RunningInstanceScanner, TaskDispatcher,
    TriggeringJobScanner, WaitingInstanceScanner,
};
use scheduler_infrastructure::{LocalLock, MemoryRegistry, MemoryStore};

/// 记录每次发送的派发请求
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Worker, ExecuteTaskParam)>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(Worker, ExecuteTaskParam)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskTransport for RecordingTransport {
    async fn dispatch(&self, worker: &Worker, params: &[ExecuteTaskParam]) -> SchedulerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rpc {
                status: Some(503),
                message: "unavailable".to_string(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        for param in params {
            sent.push((worker.clone(), param.clone()));
        }
        Ok(())
    }
}

/// 按预设的分片数拆分
///
/// `hold_split`打开后，split进入时通知`split_entered`，并一直等到`release_split`。
/// 拆分时触发panic的任务参数
pub const PANIC_PARAM: &str = "panic";

pub struct ScriptedWorkerRpc {
    pub shards: AtomicUsize,
    pub valid: AtomicBool,
    pub hold_split: AtomicBool,
    pub split_entered: Notify,
    pub release_split: Notify,
}

impl Default for ScriptedWorkerRpc {
    fn default() -> Self {
        Self {
            shards: AtomicUsize::new(1),
            valid: AtomicBool::new(true),
            hold_split: AtomicBool::new(false),
            split_entered: Notify::new(),
            release_split: Notify::new(),
        }
    }
}

#[async_trait]
impl WorkerRpc for ScriptedWorkerRpc {
    async fn verify(&self, _param: &JobHandlerParam) -> SchedulerResult<bool> {
        Ok(self.valid.load(Ordering::SeqCst))
    }

    async fn split(&self, param: &JobHandlerParam) -> SchedulerResult<Vec<String>> {
        if self.hold_split.load(Ordering::SeqCst) {
            self.split_entered.notify_one();
            self.release_split.notified().await;
        }
        if param.job_param == PANIC_PARAM {
            panic!("拆分时panic: {}", param.job_handler);
        }
        let n = self.shards.load(Ordering::SeqCst);
        Ok((0..n).map(|i| format!("{}-{i}", param.job_param)).collect())
    }
}

pub fn worker(i: u16) -> Worker {
    Worker::new("app", format!("w{i}"), "127.0.0.1", 9000 + i)
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<MemoryRegistry<Worker>>,
    pub transport: Arc<RecordingTransport>,
    pub worker_rpc: Arc<ScriptedWorkerRpc>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub manager: Arc<JobManager>,
    pub events: mpsc::UnboundedReceiver<DispatchFailedEvent>,
}

impl Harness {
    pub async fn new(workers: &[Worker]) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemoryRegistry::<Worker>::new());
        for w in workers {
            registry.register(w).await.unwrap();
        }
        let transport = Arc::new(RecordingTransport::default());
        let worker_rpc = Arc::new(ScriptedWorkerRpc::default());
        let (dispatcher, events) = TaskDispatcher::new(
            registry.clone(),
            transport.clone(),
            store.clone(),
            None,
            None,
        );
        let dispatcher = Arc::new(dispatcher);
        let manager = Arc::new(JobManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(Snowflake::new(1).unwrap()),
            dispatcher.clone(),
            worker_rpc.clone(),
            None,
        ));
        Self {
            store,
            registry,
            transport,
            worker_rpc,
            dispatcher,
            manager,
            events,
        }
    }

    pub fn triggering_scanner(&self) -> TriggeringJobScanner {
        TriggeringJobScanner::new(self.manager.clone(), Arc::new(LocalLock::new("t")), None)
    }

    /// 立即过期的恢复扫描
    pub fn running_scanner(&self) -> RunningInstanceScanner {
        RunningInstanceScanner::new(
            self.manager.clone(),
            Arc::new(LocalLock::new("r")),
            RecoveryConfig {
                period_ms: 1,
                batch_size: 100,
                expire_periods: 0,
            },
        )
    }

    pub fn waiting_scanner(&self) -> WaitingInstanceScanner {
        WaitingInstanceScanner::new(
            self.manager.clone(),
            Arc::new(LocalLock::new("w")),
            RecoveryConfig {
                period_ms: 1,
                batch_size: 100,
                expire_periods: 0,
            },
        )
    }

    /// 新增任务后把下次触发时间拨到过去，使其立即到期
    pub async fn add_due_job(&self, job: Job) -> i64 {
        let job_id = self.manager.add_job(job).await.unwrap();
        self.make_due(job_id).await;
        job_id
    }

    pub async fn make_due(&self, job_id: i64) {
        let mut job = self.job(job_id).await;
        let due = now_millis() - 1_000;
        job.next_trigger_time = Some(job.last_trigger_time.map_or(due, |last| due.max(last + 1)));
        assert!(self.store.update_trigger_time(&job).await.unwrap());
    }

    pub async fn job(&self, job_id: i64) -> Job {
        JobRepository::get(self.store.as_ref(), job_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// 模拟Worker执行已收到的全部TRIGGER任务并上报结果
    pub async fn execute_sent(&self, to_state: ExecuteState) -> usize {
        let mut executed = 0;
        for (worker, param) in self.transport.sent() {
            if param.operation != Operation::Trigger {
                continue;
            }
            let start = StartTaskParam {
                job_id: param.job_id,
                instance_id: param.instance_id,
                task_id: param.task_id,
                worker: worker.clone(),
                start_time: now_millis(),
            };
            if self.manager.start_task(&start).await.unwrap().is_none() {
                continue;
            }
            let stop = StopTaskParam {
                instance_id: param.instance_id,
                task_id: param.task_id,
                worker,
                operation: Operation::Trigger,
                to_state,
                error_msg: None,
            };
            assert!(self.manager.stop_task(&stop).await.unwrap());
            executed += 1;
        }
        executed
    }
}

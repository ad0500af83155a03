//! 内存存储
//!
//! 用于单进程部署和测试。任务、实例、分片共用一把锁，
//! 所有状态变更都是带条件的比较并交换，与数据库实现的`UPDATE ... WHERE state = ?`语义一致。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use scheduler_core::{
    models::{
        now_millis, ExecuteState, Instance, Job, JobState, RunState, RunType, Task, TriggerType,
        Worker, AWAITING_COMPLETION,
    },
    traits::{InstanceRepository, JobRepository, TaskRepository, TriggeredInstance},
    SchedulerError, SchedulerResult,
};

#[derive(Default)]
struct Tables {
    jobs: HashMap<i64, Job>,
    instances: HashMap<i64, Instance>,
    tasks: HashMap<i64, Task>,
    /// instance_id -> task_ids，保持分片顺序
    instance_tasks: HashMap<i64, Vec<i64>>,
    /// (job_id, trigger_time, run_type)唯一键
    trigger_keys: HashSet<(i64, i64, RunType)>,
}

impl Tables {
    fn unique_key(instance: &Instance) -> Option<(i64, i64, RunType)> {
        match instance.run_type {
            RunType::Schedule | RunType::Depend => {
                Some((instance.job_id, instance.trigger_time, instance.run_type))
            }
            RunType::Retry | RunType::Manual => None,
        }
    }

    fn insert_instance(&mut self, triggered: &TriggeredInstance) -> SchedulerResult<()> {
        let instance = &triggered.instance;
        if self.instances.contains_key(&instance.instance_id) {
            return Err(SchedulerError::DuplicateKey(format!(
                "instance_id={}",
                instance.instance_id
            )));
        }
        if let Some(key) = Self::unique_key(instance) {
            if self.trigger_keys.contains(&key) {
                return Err(SchedulerError::DuplicateKey(format!(
                    "job_id={}, trigger_time={}, run_type={}",
                    key.0, key.1, key.2
                )));
            }
        }
        if let Some(task) = triggered
            .tasks
            .iter()
            .find(|t| self.tasks.contains_key(&t.task_id))
        {
            return Err(SchedulerError::DuplicateKey(format!("task_id={}", task.task_id)));
        }

        if let Some(key) = Self::unique_key(instance) {
            self.trigger_keys.insert(key);
        }
        self.instances.insert(instance.instance_id, instance.clone());
        let ids = triggered.tasks.iter().map(|t| t.task_id).collect();
        self.instance_tasks.insert(instance.instance_id, ids);
        for task in &triggered.tasks {
            self.tasks.insert(task.task_id, task.clone());
        }
        Ok(())
    }

    fn apply_trigger_time(&mut self, job: &Job) -> bool {
        match self.jobs.get_mut(&job.job_id) {
            Some(stored) if stored.version == job.version => {
                stored.last_trigger_time = job.last_trigger_time;
                stored.next_trigger_time = job.next_trigger_time;
                stored.job_state = job.job_state;
                stored.remark = job.remark.clone();
                stored.scan_failed_count = job.scan_failed_count;
                stored.version += 1;
                true
            }
            _ => false,
        }
    }

    fn instance_tasks(&self, instance_id: i64) -> Vec<Task> {
        self.instance_tasks
            .get(&instance_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// 内存存储，同时实现任务、实例、分片三个仓储接口
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前的全部任务定义
    pub async fn jobs(&self) -> Vec<Job> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.job_id);
        jobs
    }

    /// 某个任务的全部实例，按实例ID排序
    pub async fn instances_of(&self, job_id: i64) -> Vec<Instance> {
        let tables = self.tables.read().await;
        let mut instances: Vec<Instance> = tables
            .instances
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.instance_id);
        instances
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert(&self, job: Job) -> SchedulerResult<i64> {
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.job_id) {
            return Err(SchedulerError::DuplicateKey(format!("job_id={}", job.job_id)));
        }
        let job_id = job.job_id;
        tables.jobs.insert(job_id, job);
        Ok(job_id)
    }

    async fn get(&self, job_id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.tables.read().await.jobs.get(&job_id).cloned())
    }

    async fn find_due(
        &self,
        max_next_trigger_time: i64,
        now: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_enabled() && j.next_scan_time <= now)
            .filter(|j| j.next_trigger_time.is_some_and(|n| n < max_next_trigger_time))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.next_trigger_time, j.job_id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn find_dependents(&self, parent_job_id: i64) -> SchedulerResult<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.trigger_type == TriggerType::Depend)
            .filter(|j| {
                j.parent_job_ids()
                    .map(|ids| ids.contains(&parent_job_id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.job_id);
        Ok(jobs)
    }

    async fn update_trigger_time(&self, job: &Job) -> SchedulerResult<bool> {
        Ok(self.tables.write().await.apply_trigger_time(job))
    }

    async fn commit_trigger(
        &self,
        job: &Job,
        triggered: &TriggeredInstance,
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        let current = tables.jobs.get(&job.job_id).map(|j| j.version);
        if current != Some(job.version) {
            debug!("任务版本冲突: {}, {:?} != {}", job.job_id, current, job.version);
            return Ok(false);
        }
        // 先写实例，唯一键冲突时任务游标不变
        tables.insert_instance(triggered)?;
        Ok(tables.apply_trigger_time(job))
    }

    async fn update_next_scan_time(
        &self,
        job_id: i64,
        expect_version: i64,
        next_scan_time: i64,
        scan_failed_count: u32,
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(&job_id) {
            Some(job) if job.version == expect_version => {
                job.next_scan_time = next_scan_time;
                job.scan_failed_count = scan_failed_count;
                job.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_state(
        &self,
        job_id: i64,
        state: JobState,
        remark: Option<String>,
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(job) = tables.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        job.job_state = state;
        job.remark = remark;
        job.version += 1;
        Ok(true)
    }

    async fn update_fixed_delay_next_trigger_time(
        &self,
        job_id: i64,
        next_trigger_time: i64,
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(&job_id) {
            Some(job)
                if job.trigger_type == TriggerType::FixedDelay
                    && job.next_trigger_time == Some(AWAITING_COMPLETION) =>
            {
                job.next_trigger_time = Some(next_trigger_time);
                job.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn get(&self, instance_id: i64) -> SchedulerResult<Option<Instance>> {
        Ok(self.tables.read().await.instances.get(&instance_id).cloned())
    }

    async fn insert(&self, triggered: &TriggeredInstance) -> SchedulerResult<()> {
        self.tables.write().await.insert_instance(triggered)
    }

    async fn find_by_trigger(
        &self,
        job_id: i64,
        trigger_time: i64,
        run_type: RunType,
    ) -> SchedulerResult<Option<Instance>> {
        let tables = self.tables.read().await;
        Ok(tables
            .instances
            .values()
            .find(|i| i.job_id == job_id && i.trigger_time == trigger_time && i.run_type == run_type)
            .cloned())
    }

    async fn find_by_root(&self, root_instance_id: i64) -> SchedulerResult<Vec<Instance>> {
        let tables = self.tables.read().await;
        let mut instances: Vec<Instance> = tables
            .instances
            .values()
            .filter(|i| i.obtain_root_instance_id() == root_instance_id)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.instance_id);
        Ok(instances)
    }

    async fn find_latest_finished(&self, job_id: i64) -> SchedulerResult<Option<Instance>> {
        let tables = self.tables.read().await;
        Ok(tables
            .instances
            .values()
            .filter(|i| i.job_id == job_id && i.run_state == RunState::Finished)
            .max_by_key(|i| (i.run_end_time, i.instance_id))
            .cloned())
    }

    async fn find_expired(
        &self,
        run_state: RunState,
        expire_time: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<Instance>> {
        let tables = self.tables.read().await;
        let mut instances: Vec<Instance> = tables
            .instances
            .values()
            .filter(|i| i.run_state == run_state && i.next_scan_time < expire_time)
            .cloned()
            .collect();
        instances.sort_by_key(|i| (i.next_scan_time, i.instance_id));
        instances.truncate(limit);
        Ok(instances)
    }

    async fn update_next_scan_time(
        &self,
        instance_id: i64,
        expect_version: i64,
        next_scan_time: i64,
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.instances.get_mut(&instance_id) {
            Some(instance) if instance.version == expect_version && !instance.is_terminal() => {
                instance.next_scan_time = next_scan_time;
                instance.update_time = now_millis();
                instance.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn start(&self, instance_id: i64, now: i64) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.instances.get_mut(&instance_id) {
            Some(instance) if instance.run_state == RunState::Waiting => {
                instance.run_state = RunState::Running;
                instance.run_start_time = Some(now);
                instance.update_time = now;
                instance.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_state(
        &self,
        instance_id: i64,
        to: RunState,
        from: &[RunState],
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.instances.get_mut(&instance_id) {
            Some(instance) if from.contains(&instance.run_state) => {
                instance.run_state = to;
                instance.update_time = now_millis();
                instance.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn terminate(
        &self,
        instance_id: i64,
        to: RunState,
        from: &[RunState],
        run_end_time: i64,
    ) -> SchedulerResult<bool> {
        if !to.is_terminal() {
            return Err(SchedulerError::StateConflict(format!("{to}不是终止状态")));
        }
        let mut tables = self.tables.write().await;
        match tables.instances.get_mut(&instance_id) {
            Some(instance) if from.contains(&instance.run_state) => {
                instance.run_state = to;
                instance.run_end_time = Some(run_end_time);
                instance.update_time = now_millis();
                instance.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn get(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(&task_id).cloned())
    }

    async fn find_by_instance(&self, instance_id: i64) -> SchedulerResult<Vec<Task>> {
        Ok(self.tables.read().await.instance_tasks(instance_id))
    }

    async fn start(&self, task_id: i64, worker: &Worker, now: i64) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&task_id) {
            Some(task)
                if task.execute_state == ExecuteState::Waiting
                    && task.worker.as_ref().map_or(true, |w| w == worker) =>
            {
                task.execute_state = ExecuteState::Executing;
                task.worker = Some(worker.clone());
                task.execute_start_time = Some(now);
                task.update_time = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn terminate(
        &self,
        task_id: i64,
        worker: Option<&Worker>,
        to: ExecuteState,
        from: ExecuteState,
        execute_end_time: Option<i64>,
        error_msg: Option<String>,
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&task_id) {
            Some(task)
                if task.execute_state == from
                    && worker.map_or(true, |w| task.worker.as_ref() == Some(w)) =>
            {
                task.execute_state = to;
                if execute_end_time.is_some() {
                    task.execute_end_time = execute_end_time;
                }
                if error_msg.is_some() {
                    task.error_msg = error_msg;
                }
                task.update_time = now_millis();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_state_by_instance(
        &self,
        instance_id: i64,
        to: ExecuteState,
        from: &[ExecuteState],
        execute_end_time: Option<i64>,
    ) -> SchedulerResult<usize> {
        let mut tables = self.tables.write().await;
        let ids = tables
            .instance_tasks
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        let now = now_millis();
        let mut count = 0;
        for id in ids {
            if let Some(task) = tables.tasks.get_mut(&id) {
                if from.contains(&task.execute_state) {
                    task.execute_state = to;
                    if execute_end_time.is_some() {
                        task.execute_end_time = execute_end_time;
                    }
                    task.update_time = now;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn update_worker(
        &self,
        task_ids: &[i64],
        worker: Option<&Worker>,
    ) -> SchedulerResult<usize> {
        let mut tables = self.tables.write().await;
        let now = now_millis();
        let mut count = 0;
        for id in task_ids {
            if let Some(task) = tables.tasks.get_mut(id) {
                if task.execute_state == ExecuteState::Waiting {
                    task.worker = worker.cloned();
                    task.update_time = now;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn savepoint(
        &self,
        task_id: i64,
        worker: &Worker,
        snapshot: &str,
    ) -> SchedulerResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&task_id) {
            Some(task)
                if task.execute_state == ExecuteState::Executing
                    && task.worker.as_ref() == Some(worker) =>
            {
                task.execute_snapshot = Some(snapshot.to_string());
                task.update_time = now_millis();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::models::{Operation, TriggerType};

    fn job(id: i64) -> Job {
        let mut job = Job::new("g", "job", "echo", TriggerType::FixedRate, "1000");
        job.job_id = id;
        job.next_trigger_time = Some(1_000);
        job
    }

    fn triggered(instance_id: i64, job_id: i64, trigger_time: i64) -> TriggeredInstance {
        TriggeredInstance {
            instance: Instance::create(instance_id, job_id, RunType::Schedule, trigger_time, 0, 0),
            tasks: vec![
                Task::create(instance_id * 10, instance_id, 0, 2, "a", None, 0),
                Task::create(instance_id * 10 + 1, instance_id, 1, 2, "b", None, 0),
            ],
        }
    }

    #[tokio::test]
    async fn test_commit_trigger_checks_version_and_unique_key() {
        let store = MemoryStore::new();
        JobRepository::insert(&store, job(1)).await.unwrap();

        let mut j = JobRepository::get(&store, 1).await.unwrap().unwrap();
        j.last_trigger_time = Some(1_000);
        j.next_trigger_time = Some(2_000);
        assert!(store.commit_trigger(&j, &triggered(10, 1, 1_000)).await.unwrap());

        // 旧版本提交失败，实例不写入
        assert!(!store.commit_trigger(&j, &triggered(11, 1, 2_000)).await.unwrap());
        assert!(InstanceRepository::get(&store, 11).await.unwrap().is_none());

        // 相同触发时间的调度实例唯一
        let mut j = JobRepository::get(&store, 1).await.unwrap().unwrap();
        j.last_trigger_time = Some(2_000);
        let err = store
            .commit_trigger(&j, &triggered(12, 1, 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateKey(_)));
        let stored = JobRepository::get(&store, 1).await.unwrap().unwrap();
        assert_eq!(stored.last_trigger_time, Some(1_000));
        assert_eq!(stored.next_trigger_time, Some(2_000));
    }

    #[tokio::test]
    async fn test_find_due_respects_scan_time_and_state() {
        let store = MemoryStore::new();
        let mut a = job(1);
        a.next_trigger_time = Some(500);
        let mut b = job(2);
        b.next_trigger_time = Some(100);
        b.next_scan_time = 10_000;
        let mut c = job(3);
        c.job_state = JobState::Disable;
        let mut d = job(4);
        d.next_trigger_time = Some(5_000);
        for j in [a, b, c, d] {
            JobRepository::insert(&store, j).await.unwrap();
        }
        let due = store.find_due(2_000, 1_000, 10).await.unwrap();
        assert_eq!(due.iter().map(|j| j.job_id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_task_state_compare_and_set() {
        let store = MemoryStore::new();
        InstanceRepository::insert(&store, &triggered(1, 1, 0)).await.unwrap();
        let w1 = Worker::new("g", "w1", "127.0.0.1", 1);
        let w2 = Worker::new("g", "w2", "127.0.0.1", 2);

        assert_eq!(store.update_worker(&[10], Some(&w1)).await.unwrap(), 1);
        assert!(!TaskRepository::start(&store, 10, &w2, 5).await.unwrap());
        assert!(TaskRepository::start(&store, 10, &w1, 5).await.unwrap());
        assert!(!TaskRepository::start(&store, 10, &w1, 5).await.unwrap());

        let to = Operation::ManualCancel.to_state();
        let first = TaskRepository::terminate(
            &store,
            10,
            Some(&w1),
            to,
            ExecuteState::Executing,
            Some(9),
            None,
        );
        let second = TaskRepository::terminate(
            &store,
            10,
            Some(&w1),
            ExecuteState::Finished,
            ExecuteState::Executing,
            Some(9),
            None,
        );
        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap() ^ second.unwrap());

        let moved = store
            .update_state_by_instance(1, ExecuteState::Paused, &[ExecuteState::Waiting], None)
            .await
            .unwrap();
        assert_eq!(moved, 1);
        let tasks = store.find_by_instance(1).await.unwrap();
        assert_eq!(tasks[1].execute_state, ExecuteState::Paused);
    }

    #[tokio::test]
    async fn test_instance_scan_claim() {
        let store = MemoryStore::new();
        InstanceRepository::insert(&store, &triggered(1, 1, 0)).await.unwrap();
        let instance = InstanceRepository::get(&store, 1).await.unwrap().unwrap();

        assert!(InstanceRepository::update_next_scan_time(&store, 1, instance.version, 100)
            .await
            .unwrap());
        assert!(!InstanceRepository::update_next_scan_time(&store, 1, instance.version, 200)
            .await
            .unwrap());

        let expired = store.find_expired(RunState::Waiting, 101, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert!(store.find_expired(RunState::Waiting, 100, 10).await.unwrap().is_empty());
    }
}

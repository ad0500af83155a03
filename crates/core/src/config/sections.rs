use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::models::{
    CollidedStrategy, Job, MisfireStrategy, RetryType, RouteStrategy, TriggerType,
};

/// Supervisor配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub bind_address: String,
    pub scan_triggering_job_period_ms: u64,
    pub scan_waiting_instance_period_ms: u64,
    pub scan_running_instance_period_ms: u64,
    pub scan_batch_size: usize,
    /// 单轮扫描内并发处理的任务数
    pub process_concurrency: usize,
    /// 连续扫描失败达到该次数后禁用任务
    pub max_scan_failed_count: u32,
    pub dispatch_retry_max_count: u32,
    pub dispatch_retry_backoff_ms: u64,
    /// 一致性哈希的虚拟节点数
    pub virtual_node_count: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            bind_address: "0.0.0.0:8081".to_string(),
            scan_triggering_job_period_ms: 3_000,    // 3秒
            scan_waiting_instance_period_ms: 15_000, // 15秒
            scan_running_instance_period_ms: 30_000, // 30秒
            scan_batch_size: 200,
            process_concurrency: 16,
            max_scan_failed_count: 5,
            dispatch_retry_max_count: 3,
            dispatch_retry_backoff_ms: 1_000, // 1秒
            virtual_node_count: 100,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("Supervisor主机地址不能为空"));
        }
        if self.scan_triggering_job_period_ms < 1_000 {
            return Err(anyhow!("触发扫描周期不能小于1000毫秒"));
        }
        if self.scan_waiting_instance_period_ms < self.scan_triggering_job_period_ms {
            return Err(anyhow!("等待实例扫描周期不能小于触发扫描周期"));
        }
        if self.scan_running_instance_period_ms < self.scan_triggering_job_period_ms {
            return Err(anyhow!("运行实例扫描周期不能小于触发扫描周期"));
        }
        if self.scan_batch_size == 0 {
            return Err(anyhow!("扫描批次大小必须大于0"));
        }
        if self.process_concurrency == 0 {
            return Err(anyhow!("并发处理数必须大于0"));
        }
        if self.max_scan_failed_count == 0 {
            return Err(anyhow!("最大扫描失败次数必须大于0"));
        }
        if self.virtual_node_count == 0 {
            return Err(anyhow!("虚拟节点数必须大于0"));
        }
        Ok(())
    }
}

/// Worker配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub group: String,
    /// 为空时启动时随机生成
    pub worker_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub bind_address: String,
    pub maximum_pool_size: usize,
    pub queue_capacity: usize,
    pub keep_alive_time_ms: u64,
    /// 关闭线程池时等待执行中任务退出的时间
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            worker_id: None,
            host: "127.0.0.1".to_string(),
            port: 8082,
            bind_address: "0.0.0.0:8082".to_string(),
            maximum_pool_size: 100,
            queue_capacity: 1_000,
            keep_alive_time_ms: 300_000, // 5分钟
            shutdown_timeout_ms: 10_000, // 10秒
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(anyhow!("Worker分组不能为空"));
        }
        if self.group.contains(':') {
            return Err(anyhow!("Worker分组不能包含冒号: {}", self.group));
        }
        if self.host.is_empty() {
            return Err(anyhow!("Worker主机地址不能为空"));
        }
        if self.maximum_pool_size == 0 {
            return Err(anyhow!("最大线程数必须大于0"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("队列容量必须大于0"));
        }
        if self.keep_alive_time_ms == 0 {
            return Err(anyhow!("空闲存活时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Memory,
    Redis,
}

/// 注册中心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub kind: RegistryKind,
    pub namespace: String,
    /// 超过该时间未续期的服务视为下线
    pub session_timeout_ms: u64,
    pub refresh_period_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Memory,
            namespace: "scheduler".to_string(),
            session_timeout_ms: 30_000, // 30秒
            refresh_period_ms: 3_000,   // 3秒
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(anyhow!("注册中心命名空间不能为空"));
        }
        if self.refresh_period_ms == 0 {
            return Err(anyhow!("注册中心刷新周期必须大于0"));
        }
        if self.session_timeout_ms <= self.refresh_period_ms {
            return Err(anyhow!("会话超时时间必须大于刷新周期"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Local,
    Redis,
}

/// 分布式锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub kind: LockKind,
    pub lease_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            kind: LockKind::Local,
            lease_ms: 30_000, // 30秒
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_ms < 1_000 {
            return Err(anyhow!("锁租期不能小于1000毫秒"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(anyhow!("Redis地址格式无效: {}", self.url));
        }
        Ok(())
    }
}

/// HTTP客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_max_count: u32,
    /// 指数退避的基数
    pub retry_backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,  // 2秒
            request_timeout_ms: 10_000, // 10秒
            retry_max_count: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(anyhow!("HTTP超时时间必须大于0"));
        }
        Ok(())
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    /// 设置后启动Prometheus指标导出
    pub prometheus_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            prometheus_address: None,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow!("无效的日志格式: {}", self.log_format));
        }
        Ok(())
    }
}

/// 启动时注册到Supervisor的任务定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSeedConfig {
    pub group: String,
    pub job_name: String,
    pub job_handler: String,
    #[serde(default)]
    pub job_param: String,
    pub trigger_type: TriggerType,
    pub trigger_value: String,
    pub route_strategy: Option<RouteStrategy>,
    pub collided_strategy: Option<CollidedStrategy>,
    pub misfire_strategy: Option<MisfireStrategy>,
    pub retry_type: Option<RetryType>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_interval_ms: i64,
    #[serde(default)]
    pub execute_timeout_ms: i64,
}

impl JobSeedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job_name.is_empty() {
            return Err(anyhow!("任务名称不能为空"));
        }
        if self.job_handler.is_empty() {
            return Err(anyhow!("任务[{}]的处理器不能为空", self.job_name));
        }
        Ok(())
    }

    pub fn to_job(&self) -> Job {
        let mut job = Job::new(
            self.group.clone(),
            self.job_name.clone(),
            self.job_handler.clone(),
            self.trigger_type,
            self.trigger_value.clone(),
        );
        job.job_param = self.job_param.clone();
        if let Some(route) = self.route_strategy {
            job.route_strategy = route;
        }
        if let Some(collided) = self.collided_strategy {
            job.collided_strategy = collided;
        }
        if let Some(misfire) = self.misfire_strategy {
            job.misfire_strategy = misfire;
        }
        if let Some(retry_type) = self.retry_type {
            job.retry_type = retry_type;
        }
        job.retry_count = self.retry_count;
        job.retry_interval_ms = self.retry_interval_ms;
        job.execute_timeout_ms = self.execute_timeout_ms;
        job
    }
}

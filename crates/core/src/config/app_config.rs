use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::sections::{
    HttpConfig, JobSeedConfig, LockConfig, LockKind, ObservabilityConfig, RedisConfig,
    RegistryConfig, RegistryKind, SupervisorConfig, WorkerConfig,
};

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
    pub lock: LockConfig,
    pub redis: RedisConfig,
    pub http: HttpConfig,
    pub observability: ObservabilityConfig,
    /// 启动时注册的任务
    pub jobs: Vec<JobSeedConfig>,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件(TOML)
    /// 3. 环境变量覆盖，例如`SCHEDULER_WORKER__GROUP=app`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/scheduler.toml", "scheduler.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.supervisor
            .validate()
            .context("Supervisor配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.registry.validate().context("注册中心配置验证失败")?;
        self.lock.validate().context("分布式锁配置验证失败")?;
        if self.registry.kind == RegistryKind::Redis || self.lock.kind == LockKind::Redis {
            self.redis.validate().context("Redis配置验证失败")?;
        }
        self.http.validate().context("HTTP配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        for job in &self.jobs {
            job.validate().context("任务配置验证失败")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RetryType, RouteStrategy, TriggerType};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.supervisor.scan_triggering_job_period_ms, 3_000);
        assert_eq!(config.registry.kind, RegistryKind::Memory);
        assert_eq!(config.lock.kind, LockKind::Local);
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let toml_str = r#"
[worker]
group = "app-a"
port = 9000
maximum_pool_size = 8

[registry]
kind = "redis"
session_timeout_ms = 60000

[observability]
log_format = "json"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.worker.group, "app-a");
        assert_eq!(config.worker.port, 9000);
        assert_eq!(config.worker.maximum_pool_size, 8);
        assert_eq!(config.worker.queue_capacity, 1_000);
        assert_eq!(config.registry.kind, RegistryKind::Redis);
        assert_eq!(config.observability.log_format, "json");
        assert_eq!(config.supervisor.scan_batch_size, 200);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.supervisor.scan_triggering_job_period_ms = 10;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.group = "a:b".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.observability.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lock.kind = LockKind::Redis;
        config.redis.url = "http://localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[supervisor]
port = 7001
scan_batch_size = 50

[http]
retry_max_count = 5
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.supervisor.port, 7001);
        assert_eq!(config.supervisor.scan_batch_size, 50);
        assert_eq!(config.http.retry_max_count, 5);
    }

    #[test]
    fn test_job_seeds() {
        let toml_str = r#"
[[jobs]]
group = "app"
job_name = "cleanup"
job_handler = "shell"
job_param = "echo cleanup"
trigger_type = "CRON"
trigger_value = "0 0 * * * ?"
retry_type = "FAILED"
retry_count = 2

[[jobs]]
group = "app"
job_name = "report"
job_handler = "http"
trigger_type = "DEPEND"
trigger_value = "1"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.jobs.len(), 2);
        let job = config.jobs[0].to_job();
        assert_eq!(job.trigger_type, TriggerType::Cron);
        assert_eq!(job.retry_type, RetryType::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.job_param, "echo cleanup");
        assert_eq!(config.jobs[1].to_job().route_strategy, RouteStrategy::RoundRobin);

        let bad = "[[jobs]]\ngroup = \"app\"\njob_name = \"\"\njob_handler = \"shell\"\ntrigger_type = \"ONCE\"\ntrigger_value = \"x\"\n";
        assert!(AppConfig::from_toml(bad).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load(Some("/nonexistent/scheduler.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = AppConfig::default();
        config.worker.worker_id = Some("w-1".to_string());
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.worker.worker_id.as_deref(), Some("w-1"));
    }
}

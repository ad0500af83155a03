pub mod app_config;
pub mod sections;

pub use app_config::AppConfig;
pub use sections::{
    HttpConfig, JobSeedConfig, LockConfig, LockKind, ObservabilityConfig, RedisConfig,
    RegistryConfig, RegistryKind, SupervisorConfig, WorkerConfig,
};

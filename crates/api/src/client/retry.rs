use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use scheduler_core::{config::HttpConfig, SchedulerError, SchedulerResult};

/// 换节点重试的退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_retries: config.retry_max_count,
            base_delay: Duration::from_millis(config.retry_backoff_ms),
            ..Default::default()
        }
    }

    /// 第`attempt`次重试前的等待：`base·2^(attempt-1)`加上`[0, base)`的随机抖动
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = if base_ms > 0 {
            rand::rng().random_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter)).min(self.max_delay)
    }

    /// 从随机位置开始轮询服务列表，只有可重试的错误才换下一个节点
    pub async fn call<S, T, F, Fut>(&self, servers: &[S], what: &str, mut op: F) -> SchedulerResult<T>
    where
        S: std::fmt::Display,
        F: FnMut(&S) -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        if servers.is_empty() {
            return Err(SchedulerError::Rpc {
                status: None,
                message: format!("{what}没有可用的服务节点"),
            });
        }
        let start = rand::rng().random_range(0..servers.len());
        let mut attempt = 0u32;
        loop {
            let server = &servers[(start + attempt as usize) % servers.len()];
            match op(server).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "{}调用{}失败，{:?}后第{}次重试: {}",
                        what, server, delay, attempt, e
                    );
                    metrics::counter!("rpc_client_retries_total", "call" => what.to_string())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_retriable_errors_rotate_servers() {
        let calls = AtomicU32::new(0);
        let servers = vec!["a".to_string(), "b".to_string()];
        let result = fast()
            .call(&servers, "test", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SchedulerError::Rpc {
                            status: Some(503),
                            message: "down".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retriable_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let servers = vec!["a".to_string()];
        let result: SchedulerResult<()> = fast()
            .call(&servers, "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SchedulerError::Rpc {
                        status: Some(400),
                        message: "bad".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let servers = vec!["a".to_string(), "b".to_string()];
        let result: SchedulerResult<()> = fast()
            .call(&servers, "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SchedulerError::Timeout) }
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

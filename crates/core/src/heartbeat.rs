use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::SchedulerResult;

/// 连续处理多少轮后强制让出到下一秒
const MAX_PROCESSED_COUNT: u32 = 17;

/// 周期性执行的后台任务
#[async_trait]
pub trait Heartbeat: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// 返回true表示本轮已处理完毕，休眠一个周期；false表示还有积压，立即进入下一轮
    async fn heartbeat(&self) -> SchedulerResult<bool>;
}

pub struct HeartbeatHandle {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 通知退出并等待当前一轮结束
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!("心跳任务退出异常 {}: {}", self.name, e);
        }
    }
}

/// 启动心跳循环
///
/// 休眠时间为`2/3周期 + 随机[0, 2/3周期)`，多个进程的扫描因此自然错开。
/// 单轮出错或panic只记录日志，循环只会因取消而结束。
pub fn spawn_heartbeat(
    task: Arc<dyn Heartbeat>,
    period_ms: u64,
    parent: &CancellationToken,
) -> HeartbeatHandle {
    let cancel = parent.child_token();
    let name = task.name().to_string();
    let base_ms = (period_ms * 2 / 3).max(1);
    let token = cancel.clone();

    let join = tokio::spawn(async move {
        info!("心跳任务启动: {}", task.name());
        let mut processed_count = 0u32;
        loop {
            if token.is_cancelled() {
                break;
            }

            let begin = Instant::now();
            let drained = match AssertUnwindSafe(task.heartbeat()).catch_unwind().await {
                Ok(Ok(drained)) => drained,
                Ok(Err(e)) => {
                    error!("心跳任务执行失败 {}: {}", task.name(), e);
                    true
                }
                Err(panic) => {
                    error!("心跳任务panic {}: {}", task.name(), panic_message(&*panic));
                    true
                }
            };
            debug!(
                "心跳任务 {} 本轮耗时: {}ms",
                task.name(),
                begin.elapsed().as_millis()
            );

            let sleep_ms = if drained {
                processed_count = 0;
                base_ms + rand::rng().random_range(0..base_ms)
            } else {
                processed_count += 1;
                if processed_count <= MAX_PROCESSED_COUNT {
                    continue;
                }
                processed_count = 0;
                let ms = (crate::models::now_millis() % 1_000) as u64;
                if ms == 0 {
                    1_000
                } else {
                    1_000 - ms
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
        }
        info!("心跳任务结束: {}", task.name());
    });

    HeartbeatHandle { name, cancel, join }
}

/// panic携带的消息，非字符串时返回占位文本
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedulerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
        backlog: u32,
        fail: bool,
    }

    #[async_trait]
    impl Heartbeat for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn heartbeat(&self) -> SchedulerResult<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(SchedulerError::Internal("boom".to_string()));
            }
            Ok(n > self.backlog)
        }
    }

    #[tokio::test]
    async fn test_backlog_runs_without_waiting_period() {
        let task = Arc::new(Counting {
            calls: AtomicU32::new(0),
            backlog: 5,
            fail: false,
        });
        let root = CancellationToken::new();
        let handle = spawn_heartbeat(task.clone(), 60_000, &root);
        tokio::time::sleep(Duration::from_millis(200)).await;
        // 积压的5轮加上处理完毕的一轮，然后进入一分钟的休眠
        assert_eq!(task.calls.load(Ordering::SeqCst), 6);
        handle.stop().await;
    }

    struct Panicking {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Heartbeat for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn heartbeat(&self) -> SchedulerResult<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 2 == 1 {
                panic!("round {n}");
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_panic_does_not_stop_loop() {
        let task = Arc::new(Panicking {
            calls: AtomicU32::new(0),
        });
        let root = CancellationToken::new();
        let handle = spawn_heartbeat(task.clone(), 30, &root);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(task.calls.load(Ordering::SeqCst) >= 3);
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(&*payload), "未知panic");
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_loop() {
        let task = Arc::new(Counting {
            calls: AtomicU32::new(0),
            backlog: 0,
            fail: true,
        });
        let root = CancellationToken::new();
        let handle = spawn_heartbeat(task.clone(), 30, &root);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(task.calls.load(Ordering::SeqCst) >= 3);
        assert!(!handle.is_finished());
        root.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}

use async_trait::async_trait;

use crate::SchedulerResult;

/// 命名的分布式锁，每个扫描器一把
///
/// 获取失败不是错误：说明其它Supervisor正在处理本轮扫描。
#[async_trait]
pub trait DistributedLock: Send + Sync {
    fn name(&self) -> &str;

    /// 非阻塞获取，成功返回true
    async fn try_lock(&self) -> SchedulerResult<bool>;

    async fn unlock(&self) -> SchedulerResult<()>;
}

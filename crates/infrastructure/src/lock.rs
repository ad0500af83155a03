use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use scheduler_core::{traits::DistributedLock, SchedulerError, SchedulerResult};

/// 单进程内的锁
pub struct LocalLock {
    name: String,
    locked: AtomicBool,
}

impl LocalLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locked: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_lock(&self) -> SchedulerResult<bool> {
        Ok(self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn unlock(&self) -> SchedulerResult<()> {
        self.locked.store(false, Ordering::Release);
        Ok(())
    }
}

const LOCK_SCRIPT: &str = r#"
if (redis.call('exists', KEYS[1]) == 0) or (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
    redis.call('hincrby', KEYS[1], ARGV[2], 1)
    redis.call('pexpire', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('hexists', KEYS[1], ARGV[1]) == 0 then
    return 0
end
if redis.call('hincrby', KEYS[1], ARGV[1], -1) > 0 then
    return 1
end
redis.call('del', KEYS[1])
return 1
"#;

/// Redis可重入锁
///
/// 锁为哈希结构，字段是持有者标识，值是重入次数；租期到期后自动释放。
pub struct RedisLock {
    conn: ConnectionManager,
    name: String,
    key: String,
    owner: String,
    lease_ms: u64,
    lock_script: Script,
    unlock_script: Script,
}

impl RedisLock {
    /// 建立锁使用的Redis连接，多把锁可以共用
    pub async fn connection(url: &str) -> SchedulerResult<ConnectionManager> {
        let client = redis::Client::open(url)?;
        Ok(client.get_connection_manager().await?)
    }

    pub fn new(
        conn: ConnectionManager,
        namespace: &str,
        name: impl Into<String>,
        owner: impl Into<String>,
        lease_ms: u64,
    ) -> Self {
        let name = name.into();
        Self {
            conn,
            key: format!("{namespace}:lock:{name}"),
            name,
            owner: owner.into(),
            lease_ms,
            lock_script: Script::new(LOCK_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_lock(&self) -> SchedulerResult<bool> {
        let mut conn = self.conn.clone();
        let acquired: i32 = self
            .lock_script
            .key(&self.key)
            .arg(self.lease_ms)
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await?;
        if acquired == 0 {
            debug!("锁已被其它进程持有: {}", self.key);
        }
        Ok(acquired == 1)
    }

    async fn unlock(&self) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        let released: i32 = self
            .unlock_script
            .key(&self.key)
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            return Err(SchedulerError::Lock(format!(
                "当前进程未持有锁: {}",
                self.key
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_lock_is_exclusive() {
        let lock = LocalLock::new("scan");
        assert_eq!(lock.name(), "scan");
        assert!(lock.try_lock().await.unwrap());
        assert!(!lock.try_lock().await.unwrap());
        lock.unlock().await.unwrap();
        assert!(lock.try_lock().await.unwrap());
    }
}

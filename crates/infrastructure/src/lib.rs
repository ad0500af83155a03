pub mod lock;
pub mod memory;
pub mod registry;

pub use lock::{LocalLock, RedisLock};
pub use redis::aio::ConnectionManager;
pub use memory::MemoryStore;
pub use registry::{MemoryRegistry, RedisRegistry};

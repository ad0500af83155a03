pub mod config;
pub mod errors;
pub mod hash_ring;
pub mod heartbeat;
pub mod id_generator;
pub mod logging;
pub mod models;
pub mod timing_wheel;
pub mod traits;

pub use errors::{is_retriable_status, SchedulerError, SchedulerResult};

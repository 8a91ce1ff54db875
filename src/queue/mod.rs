// Job queue: envelope codec, correlation broker and the reference worker

pub mod broker;
pub mod jobs;
pub mod memory;
pub mod redis_broker;
pub mod registry;
pub mod workers;

pub use broker::{BrokerError, BrokerStatus, Delivery, JobBroker};
pub use jobs::{Job, JobOptions, JobResult, Outcome, WorkerError};
pub use memory::MemoryBroker;
pub use redis_broker::{RedisBroker, RedisJobSource};
pub use registry::WaitRegistry;
pub use workers::{Inference, JobSource, Worker};

//! Conveyor Jobs - asynchronous job processing
//!
//! Producers submit jobs through a [`Dispatcher`], a [`Broker`] carries them
//! to a [`WorkerPool`], and clients poll a [`StatusResolver`] until the job
//! reaches a terminal state.
//!
//! - Kinds are registered once in a [`JobRegistry`] with a handler, a
//!   deadline and declared parameters
//! - Handlers run on the blocking thread pool under their kind's deadline
//! - Results are stored per job id with a TTL; terminal results are final
//! - Two brokers: Redis for deployments, in-memory for tests and single
//!   process setups
//! - Late acknowledgment (default) gives at-least-once execution
//!
//! # Architecture
//!
//! ```text
//!  Producer ──► Dispatcher ──submit──► Broker queue
//!                  │                       │ consume
//!            JobRegistry ◄──lookup── WorkerPool ──► handler (blocking pool,
//!                                          │          deadline enforced)
//!                                          ▼
//!  Client ◄── StatusResolver ◄──get── Broker result store
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_jobs::{ArgType, Dispatcher, InMemoryBroker, JobArguments,
//!     JobRegistry, KindDefinition, StatusResolver, WorkerPool};
//!
//! let mut registry = JobRegistry::new();
//! registry.register(
//!     KindDefinition::new("shout", |args: &JobArguments| {
//!         Ok(args.require_str("text")?.to_uppercase().into())
//!     })
//!     .param("text", ArgType::String),
//! )?;
//!
//! let broker = Arc::new(InMemoryBroker::new(AckMode::Late));
//! let registry = Arc::new(registry);
//! let pool = WorkerPool::new(broker.clone(), registry.clone(), Default::default());
//! pool.start().await?;
//!
//! let id = Dispatcher::new(broker.clone(), registry)
//!     .enqueue("shout", JobArguments::new().with("text", "hi"))
//!     .await?;
//! let status = StatusResolver::new(broker).status(&id).await?;
//! ```

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod registry;
pub mod retry;
pub mod status;
pub mod worker;

pub use broker::{AckMode, Broker, Delivery, JobSnapshot, PutOutcome};
pub use config::{BrokerBackend, DispatchConfig, JobsConfig};
pub use dispatcher::Dispatcher;
pub use error::{JobError, JobsResult};
pub use job::{FailureKind, Job, JobArguments, JobFailure, JobId, JobResult, ResultState};
pub use memory::InMemoryBroker;
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use redis::RedisBroker;
pub use registry::{
    ArgType, Handler, HandlerError, JobRegistry, KindDefinition, KindDescriptor, ParamSpec,
    RegistryEntry, DEFAULT_DEADLINE,
};
pub use retry::Backoff;
pub use status::{JobStatus, StatusResolver};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};

use std::sync::Arc;

/// Builds the broker selected by `config.broker.backend`.
pub async fn connect_broker(config: &JobsConfig) -> JobsResult<Arc<dyn Broker>> {
    match config.broker.backend {
        BrokerBackend::Memory => Ok(Arc::new(InMemoryBroker::from_config(config))),
        BrokerBackend::Redis => Ok(Arc::new(RedisBroker::connect(config).await?)),
    }
}

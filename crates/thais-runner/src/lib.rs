//! Runtime around a thais shard: configuration, logging, the world
//! heartbeat and the [`ShardRunner`] that owns the dispatch loop.

pub mod config;
mod heartbeat;
pub mod logging;
mod observers;
mod reporter;
mod runner;

pub use config::{ConfigLoadError, LoggingConfig, SchedulerConfig, ServerConfig, ThaisConfig};
pub use heartbeat::{start_heartbeat, ShardWorld, HEARTBEAT_LABEL};
pub use observers::LoggingObserver;
pub use reporter::StatsReporter;
pub use runner::{BuildError, RunError, ShardReport, ShardRunner, ShardRunnerBuilder};

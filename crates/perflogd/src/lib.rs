//! MPTCP Subflow Performance Logger
//!
//! Periodically samples per-subflow TCP statistics of one MPTCP socket and
//! writes them to a sample store, keyed by a random iteration id.
//!
//! Each tick the sampling loop:
//! 1. Queries the kernel for every active subflow's `tcp_info`
//! 2. Registers subflows it has not seen before, with their local and remote
//!    addresses (one address lookup per tick at most)
//! 3. Filters each subflow's features down to the selected set and records
//!    the sample
//!
//! The loop runs on a dedicated thread owned by [`SamplingEngine`]; telemetry
//! and persistence sit behind the [`SubflowTelemetry`] and [`StoreFactory`]
//! traits so that both can be replaced in tests.

pub mod config_file;
pub mod engine;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod metrics_server;
pub mod reporter;
pub mod sqlite_store;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config_file::PerflogConfig;
pub use engine::{EngineState, SamplingEngine, random_iteration_id};
pub use error::{PerflogError, Result};
pub use filter::{FeatureSelection, RESERVED_COLUMNS, filter_features};
pub use metrics::SamplerMetrics;
pub use reporter::{IterationReporter, LogReporter};
pub use sqlite_store::{SqliteStore, SqliteStoreFactory};
pub use store::{MemoryStoreFactory, SampleStore, StoreEvent, StoreFactory};
pub use telemetry::{MptcpSockopt, SubflowTelemetry};
pub use types::{FeatureMap, FeatureValue, SocketHandle, SubflowAddrs, SubflowId, SubflowStats};

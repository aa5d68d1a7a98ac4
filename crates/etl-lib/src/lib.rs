//! Engine library for the scheduled metrics ETL
//!
//! This crate provides the core functionality for:
//! - Connector registry and per-endpoint client lifecycle with TTL caching
//! - Threshold classification transforms, including time-windowed inertia
//! - Bounded-size batching for bulk loads
//! - Self-metering with threshold alerts on the pipeline's own health
//! - Cluster coordination gating which process runs the scheduler
//! - The scheduler driving extract, transform and load cycles

pub mod batcher;
pub mod cache;
pub mod client;
pub mod cluster;
pub mod connector;
pub mod error;
pub mod metering;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod polling;
pub mod shutdown;
pub mod transform;

pub use error::{BootstrapError, ClientError, ClusterError, EtlError};
pub use models::*;
pub use observability::{EtlMetrics, StructuredLogger};
pub use shutdown::{ShutdownHook, ShutdownSequence};

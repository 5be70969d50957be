//! Continuous backup of content-addressed DAGs from an IPFS node into
//! S3-compatible object storage.
//!
//! The pipeline discovers pending uploads in a relational catalog, exports
//! each DAG as a CAR stream from a co-located IPFS daemon, uploads it to
//! the object store, and registers the durable location back in the
//! catalog. Failure memory keeps deterministic failures from being
//! re-attempted on every scan.

pub mod candidate;
pub mod catalog;
pub mod config;
pub mod error;
pub mod export;
pub mod failures;
pub mod ipfs;
pub mod metrics;
pub mod pipeline;
pub mod signal;
pub mod sink;
pub mod swarm;
pub mod tracing;

pub use crate::config::Config;
pub use crate::error::BackupError;
pub use crate::pipeline::{BackupOutcome, BackupPipeline, RunTotals};
pub use crate::tracing::init_tracing;

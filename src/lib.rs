//! Kestrel - streaming dispatch and merge-aggregation engine for trace collectors.
//!
//! Kestrel is the ingest side of a tracing backend. Agents report segments,
//! service references, runtime samples and heartbeats; Kestrel turns them
//! into time-bucketed metrics and writes them to storage with bounded memory.
//!
//! # Architecture
//!
//! - `channel`: partitioned bounded buffers and the consumer pool draining them
//! - `worker`: roles, selectors, worker references and the cluster layer
//! - `analysis`: payload analyzers producing minute metric records
//! - `persistence`: merge-on-flush workers and the flush timer
//! - `storage`: the DAO boundary and an in-memory implementation
//! - `pipeline`: wiring of all of the above with an ordered shutdown
//! - `cli`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use kestrel_lib::core::Config;
//! use kestrel_lib::pipeline::IngestPipeline;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = IngestPipeline::builder(Config::default()).build()?;
//!     // pipeline.produce(message);
//!     let report = pipeline.shutdown()?;
//!     println!("{} rows written", report.written);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod analysis;
pub mod channel;
pub mod cli;
pub mod core;
pub mod generator;
pub mod metrics;
pub mod monitoring;
pub mod persistence;
pub mod pipeline;
pub mod storage;
pub mod worker;

pub use crate::core::{Config, KestrelError, Message, Payload, Result};
pub use crate::pipeline::IngestPipeline;

//! Core domain types, configuration and errors for Kestrel.
//!
//! Everything here is shared by the channel, worker and persistence layers.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder, OverflowStrategy};
pub use error::{KestrelError, Result};
pub use types::{
    AggregationKey, Downsampling, Heartbeat, JvmSample, Message, Payload, PayloadKind,
    ServiceName, ServiceReference, TraceSegment,
};

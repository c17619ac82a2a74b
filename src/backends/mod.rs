//! Backend adapters
//!
//! Each backend family translates [`MetricRecord`](crate::record::MetricRecord)
//! batches into its own wire format:
//!
//! - [`lineproto`]: InfluxDB 1.x/2.x/3.x, QuestDB and VictoriaMetrics
//! - [`timescale`]: TimescaleDB with on-demand schema provisioning
//! - [`remote_write`]: Prometheus remote write

pub mod adapter;
pub mod error;
pub mod lineproto;
pub mod remote_write;
pub mod timescale;

pub use adapter::{BackendAdapter, WriteReport};
pub use error::{BackendError, BackendResult, FailureKind};

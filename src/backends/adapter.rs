//! Backend adapter trait definition
//!
//! This module defines the `BackendAdapter` trait that every backend
//! family implements.

use std::ops::AddAssign;

use async_trait::async_trait;

use super::error::BackendResult;
use crate::record::MetricRecord;

/// Counts reported by a successful write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Records delivered to the backend
    pub written: usize,

    /// Records rejected by validation before serialization
    pub skipped: usize,

    /// Records lost to a measurement-level failure (schema or insert)
    pub failed: usize,

    /// Individual values dropped because of a schema conflict
    pub dropped_values: usize,
}

impl WriteReport {
    pub fn written(written: usize) -> Self {
        Self {
            written,
            ..Self::default()
        }
    }
}

impl AddAssign for WriteReport {
    fn add_assign(&mut self, other: Self) {
        self.written += other.written;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.dropped_values += other.dropped_values;
    }
}

/// Trait for storage backend adapters
///
/// One implementation exists per backend family (line protocol,
/// TimescaleDB, remote write). Adapters are built once by the registry and
/// live for the whole process.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` since the dispatcher drives each
/// adapter from its own task. The dispatcher never runs two writes against
/// the same adapter at once.
///
/// ## Error Handling
///
/// Invalid records and per-measurement problems are absorbed and reported
/// through [`WriteReport`]. An `Err` means the batch as a whole did not
/// reach the backend.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Lightweight reachability and credential check
    ///
    /// Called once during registry construction. A failing probe keeps the
    /// backend out of the registry.
    async fn probe(&self) -> BackendResult<()>;

    /// Write a batch of records as one delivery
    async fn write(&self, batch: &[MetricRecord]) -> BackendResult<WriteReport>;

    /// Human-readable endpoint description for logs
    fn endpoint(&self) -> String;

    /// Close connections and release resources
    async fn close(&self) -> BackendResult<()>;
}

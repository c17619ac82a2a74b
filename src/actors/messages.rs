//! Message types for the dispatch actor
//!
//! Commands are sent over an mpsc channel; commands that need an answer
//! carry a oneshot sender for the reply.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::dispatcher::DispatchOutcome;
use crate::record::MetricRecord;

/// Commands that can be sent to the DispatchActor
#[derive(Debug)]
pub enum DispatchCommand {
    /// Buffer records for the next dispatch
    ///
    /// A dispatch runs as soon as the buffer reaches the batch size.
    Submit { records: Vec<MetricRecord> },

    /// Dispatch whatever is buffered right now
    Flush {
        /// `None` when the buffer was empty
        respond_to: oneshot::Sender<Option<DispatchOutcome>>,
    },

    /// Get dispatch statistics
    GetStats {
        respond_to: oneshot::Sender<DispatchStats>,
    },

    /// Flush, close every backend and stop
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Dispatch statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    /// Number of dispatch calls performed
    pub batches_dispatched: u64,

    /// Records handed to the dispatcher
    pub records_dispatched: u64,

    /// Records waiting in the buffer
    pub buffered: usize,

    /// Failed writes per backend
    pub backend_failures: BTreeMap<String, u64>,

    /// Batches that no backend accepted
    pub total_failures: u64,
}

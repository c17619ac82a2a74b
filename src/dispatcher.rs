//! Fan-out of record batches to every registered backend
//!
//! Each backend write runs in its own task under a timeout. A backend that
//! fails, times out or panics only fills its own slot in the
//! [`DispatchOutcome`]; the others are unaffected.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use crate::backends::{BackendError, FailureKind, WriteReport};
use crate::config::{BackendKind, DispatchConfig};
use crate::record::MetricRecord;
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Upper bound for one backend write, including waiting for the
    /// previous write to the same backend
    pub write_timeout: Duration,

    /// Field keys coerced to integers before fan-out
    pub integer_fields: Vec<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for DispatchOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            write_timeout: config.write_timeout(),
            integer_fields: config.integer_fields.clone(),
        }
    }
}

/// Why one backend did not accept a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&BackendError> for Failure {
    fn from(err: &BackendError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// Result of one batch for one backend
#[derive(Debug, Clone)]
pub struct BackendOutcome {
    pub backend: String,
    pub kind: BackendKind,
    pub result: Result<WriteReport, Failure>,
}

/// One outcome per registered backend, in registry order
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub outcomes: Vec<BackendOutcome>,
}

impl DispatchOutcome {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, backend: &str) -> Option<&BackendOutcome> {
        self.outcomes.iter().find(|o| o.backend == backend)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Every backend failed; the caller should escalate
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.succeeded() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Failure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|f| (o.backend.as_str(), f)))
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, options: DispatchOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Write one batch to every backend concurrently
    ///
    /// Returns once every backend has produced an outcome or hit the write
    /// timeout. Batches dispatched one after another reach each backend in
    /// the same order.
    #[instrument(skip_all, fields(records = batch.len(), backends = self.registry.len()))]
    pub async fn dispatch(&self, mut batch: Vec<MetricRecord>) -> DispatchOutcome {
        for record in &mut batch {
            record.coerce_integer_fields(&self.options.integer_fields);
        }
        let batch: Arc<[MetricRecord]> = batch.into();

        let write_timeout = self.options.write_timeout;
        let tasks = self.registry.backends().iter().map(|backend| {
            let backend = backend.clone();
            let batch = batch.clone();

            tokio::spawn(async move {
                let write = async {
                    let _guard = backend.write_lock().lock().await;
                    backend.adapter.write(&batch).await
                };

                match tokio::time::timeout(write_timeout, write).await {
                    Ok(Ok(report)) => Ok(report),
                    Ok(Err(e)) => Err(Failure::from(&e)),
                    Err(_) => Err(Failure::from(&BackendError::Timeout(write_timeout))),
                }
            })
        });

        let results = join_all(tasks).await;

        let outcomes: Vec<BackendOutcome> = self
            .registry
            .backends()
            .iter()
            .zip(results)
            .map(|(backend, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    Err(Failure {
                        kind: FailureKind::Internal,
                        message: format!("write task aborted: {e}"),
                    })
                });

                if let Err(failure) = &result {
                    let transient = if failure.kind.is_transient() {
                        "transient"
                    } else {
                        "permanent"
                    };
                    warn!("{} ({}): {} ({})", backend.id, backend.kind, failure, transient);
                }

                BackendOutcome {
                    backend: backend.id.clone(),
                    kind: backend.kind,
                    result,
                }
            })
            .collect();

        let outcome = DispatchOutcome { outcomes };
        log_summary(&outcome, batch.len());
        outcome
    }
}

fn log_summary(outcome: &DispatchOutcome, records: usize) {
    let succeeded = outcome.succeeded();
    let failed = outcome.failed();

    if outcome.all_failed() {
        error!("dispatch of {} records failed on all {} backends", records, failed);
    } else if failed > 0 {
        warn!(
            "dispatched {} records: {} backends succeeded, {} failed",
            records, succeeded, failed
        );
    } else {
        info!("dispatched {} records to {} backends", records, succeeded);
    }
}

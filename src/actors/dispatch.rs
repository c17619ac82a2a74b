//! DispatchActor - Batches records and fans them out to every backend
//!
//! ## Batching Strategy
//!
//! Records are buffered and dispatched as one batch when either trigger
//! fires:
//! - **Size trigger**: the buffer reaches `batch_size` records
//! - **Time trigger**: `flush_interval` has elapsed
//!
//! Dispatches run one at a time on the actor task, so consecutive batches
//! reach every backend in submission order.

use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, instrument, trace, warn};

use super::messages::{DispatchCommand, DispatchStats};
use crate::config::DispatchConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::record::MetricRecord;

pub struct DispatchActor {
    command_rx: mpsc::Receiver<DispatchCommand>,
    dispatcher: Dispatcher,
    buffer: Vec<MetricRecord>,
    batch_size: usize,
    flush_interval: Duration,
    stats: DispatchStats,
}

impl DispatchActor {
    pub fn new(
        command_rx: mpsc::Receiver<DispatchCommand>,
        dispatcher: Dispatcher,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            command_rx,
            dispatcher,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            flush_interval,
            stats: DispatchStats::default(),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!(
            "starting dispatch actor (batch size {}, flush every {:?})",
            self.batch_size, self.flush_interval
        );

        let mut flush_interval = time::interval(self.flush_interval);
        flush_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let shutdown_ack = loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(DispatchCommand::Shutdown { respond_to }) => {
                        debug!("received shutdown command");
                        break Some(respond_to);
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        warn!("command channel closed, shutting down");
                        break None;
                    }
                },

                _ = flush_interval.tick() => {
                    if !self.buffer.is_empty() {
                        trace!("time-based flush triggered ({} records)", self.buffer.len());
                        self.flush().await;
                    }
                }
            }
        };

        self.command_rx.close();

        if !self.buffer.is_empty() {
            debug!("final flush before shutdown ({} records)", self.buffer.len());
            self.flush().await;
        }

        debug!("closing backends");
        self.dispatcher.registry().close_all().await;

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        debug!("dispatch actor stopped");
    }

    async fn handle_command(&mut self, command: DispatchCommand) {
        match command {
            DispatchCommand::Submit { records } => {
                trace!("buffering {} records", records.len());
                self.buffer.extend(records);

                while self.buffer.len() >= self.batch_size {
                    trace!("size-based flush triggered ({} records)", self.buffer.len());
                    let batch: Vec<MetricRecord> = self.buffer.drain(..self.batch_size).collect();
                    self.dispatch(batch).await;
                }
            }

            DispatchCommand::Flush { respond_to } => {
                debug!("manual flush requested");
                let outcome = self.flush().await;
                let _ = respond_to.send(outcome);
            }

            DispatchCommand::GetStats { respond_to } => {
                let stats = DispatchStats {
                    buffered: self.buffer.len(),
                    ..self.stats.clone()
                };
                let _ = respond_to.send(stats);
            }

            DispatchCommand::Shutdown { .. } => {}
        }
    }

    async fn flush(&mut self) -> Option<DispatchOutcome> {
        if self.buffer.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut self.buffer);
        Some(self.dispatch(batch).await)
    }

    async fn dispatch(&mut self, batch: Vec<MetricRecord>) -> DispatchOutcome {
        let records = batch.len();
        let outcome = self.dispatcher.dispatch(batch).await;

        self.stats.batches_dispatched += 1;
        self.stats.records_dispatched += records as u64;
        for (backend, _) in outcome.failures() {
            *self
                .stats
                .backend_failures
                .entry(backend.to_string())
                .or_default() += 1;
        }

        if outcome.all_failed() {
            self.stats.total_failures += 1;
            error!(
                "batch #{} of {} records was not written to any backend",
                self.stats.batches_dispatched, records
            );
        }

        outcome
    }
}

/// Handle for controlling the DispatchActor
#[derive(Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<DispatchCommand>,
}

impl DispatchHandle {
    /// Spawn a new dispatch actor
    pub fn spawn(dispatcher: Dispatcher, config: &DispatchConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = DispatchActor::new(
            cmd_rx,
            dispatcher,
            config.batch_size,
            config.flush_interval(),
        );

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    async fn send(&self, command: DispatchCommand) -> anyhow::Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| anyhow!("dispatch actor is not running"))
    }

    /// Queue records for dispatch
    pub async fn submit(&self, records: Vec<MetricRecord>) -> anyhow::Result<()> {
        self.send(DispatchCommand::Submit { records }).await
    }

    /// Dispatch the buffer now
    pub async fn flush(&self) -> anyhow::Result<Option<DispatchOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatchCommand::Flush { respond_to: tx }).await?;

        Ok(rx.await?)
    }

    /// Get dispatch statistics
    pub async fn stats(&self) -> Option<DispatchStats> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatchCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Flush, close all backends and wait for the actor to stop
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatchCommand::Shutdown { respond_to: tx }).await?;

        Ok(rx.await?)
    }
}

//! Multi-backend metric dispatcher
//!
//! Collectors hand batches of [`MetricRecord`]s to a [`Dispatcher`], which
//! writes each batch to every backend in the [`Registry`] concurrently and
//! reports one outcome per backend.

pub mod actors;
pub mod backends;
pub mod config;
pub mod dispatcher;
pub mod record;
pub mod registry;

pub use dispatcher::{BackendOutcome, DispatchOptions, DispatchOutcome, Dispatcher, Failure};
pub use record::{FieldValue, MetricRecord, ValidationError};
pub use registry::{DefaultFactory, Registry, RegistryError};

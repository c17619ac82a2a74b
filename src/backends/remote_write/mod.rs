//! Prometheus remote-write backend

mod adapter;
pub mod proto;
pub mod series;

pub use adapter::{RemoteWriteAdapter, encode_request};

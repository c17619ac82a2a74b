//! Line-protocol backend family (InfluxDB, QuestDB, VictoriaMetrics)

mod adapter;
pub mod encode;

pub use adapter::LineProtocolAdapter;
pub use encode::{EncodedBatch, encode_batch, encode_record};

//! Mapping from metric records to remote-write time series
//!
//! Every numeric field of a record becomes one series named
//! `<measurement>_<field>`, labelled with the record's tags.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use super::proto::{Label, Sample, TimeSeries, WriteRequest};
use crate::record::{FieldValue, MetricRecord, ValidationError};

pub const METRIC_NAME_LABEL: &str = "__name__";

fn sanitize(raw: &str, allow_colon: bool) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Normalize to `[a-zA-Z_:][a-zA-Z0-9_:]*`
pub fn sanitize_metric_name(raw: &str) -> String {
    sanitize(raw, true)
}

/// Normalize to `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn sanitize_label_name(raw: &str) -> String {
    sanitize(raw, false)
}

/// Series produced by one record
#[derive(Debug, Default)]
pub struct RecordSeries {
    pub series: Vec<TimeSeries>,

    /// Field values with no numeric representation
    pub dropped_values: usize,
}

/// Convert one record; a label set that is not unique after
/// normalization rejects the whole record
pub fn record_series(record: &MetricRecord) -> Result<RecordSeries, ValidationError> {
    record.validate()?;

    let mut labels = BTreeMap::new();
    for (key, value) in record.tags.iter().filter(|(_, v)| !v.is_empty()) {
        let name = sanitize_label_name(key);
        if name == METRIC_NAME_LABEL || labels.insert(name.clone(), value.clone()).is_some() {
            return Err(ValidationError::DuplicateLabel(name));
        }
    }

    let timestamp = record.timestamp.timestamp_millis();
    let mut names = BTreeSet::new();
    let mut output = RecordSeries::default();

    for (key, value) in &record.fields {
        let value = match value {
            FieldValue::String(_) => {
                debug!("{}: string field '{}' not representable", record.measurement, key);
                output.dropped_values += 1;
                continue;
            }
            other => other.as_f64(),
        };
        let Some(value) = value else {
            output.dropped_values += 1;
            continue;
        };

        let name = sanitize_metric_name(&format!("{}_{}", record.measurement, key));
        if !names.insert(name.clone()) {
            warn!("{}: field '{}' collides with series {}", record.measurement, key, name);
            output.dropped_values += 1;
            continue;
        }

        let mut series_labels = Vec::with_capacity(labels.len() + 1);
        series_labels.push(Label {
            name: METRIC_NAME_LABEL.to_string(),
            value: name,
        });
        series_labels.extend(labels.iter().map(|(name, value)| Label {
            name: name.clone(),
            value: value.clone(),
        }));
        series_labels.sort_by(|a, b| a.name.cmp(&b.name));

        output.series.push(TimeSeries {
            labels: series_labels,
            samples: vec![Sample { value, timestamp }],
        });
    }

    Ok(output)
}

/// A batch converted into one request
#[derive(Debug, Default)]
pub struct SeriesBatch {
    pub request: WriteRequest,
    pub written: usize,
    pub skipped: usize,
    pub dropped_values: usize,
}

pub fn build_request(batch: &[MetricRecord]) -> SeriesBatch {
    let mut output = SeriesBatch::default();

    for record in batch {
        match record_series(record) {
            Ok(converted) if converted.series.is_empty() => {
                debug!("{}: no numeric fields, skipped", record.measurement);
                output.dropped_values += converted.dropped_values;
                output.skipped += 1;
            }
            Ok(converted) => {
                output.request.timeseries.extend(converted.series);
                output.dropped_values += converted.dropped_values;
                output.written += 1;
            }
            Err(e) => {
                warn!("skipping invalid record for '{}': {}", record.measurement, e);
                output.skipped += 1;
            }
        }
    }

    output
}

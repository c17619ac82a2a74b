//! Line protocol serialization
//!
//! ```text
//! measurement[,tag=value...] field=value[,field=value...] timestamp_ns
//! ```
//!
//! Measurement names escape `\`, `,` and space; tag keys, tag values and
//! field keys additionally escape `=`. String field values are quoted with
//! `\` and `"` escaped. Integers carry the `i` suffix so they are not read
//! back as floats.

use tracing::warn;

use crate::record::{FieldValue, MetricRecord, ValidationError};

/// A batch rendered to one newline-delimited payload
#[derive(Debug, Default)]
pub struct EncodedBatch {
    pub payload: String,
    pub written: usize,
    pub skipped: usize,
}

fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

fn escape_measurement(out: &mut String, value: &str) {
    escape_into(out, value, &[',', ' ']);
}

fn escape_key(out: &mut String, value: &str) {
    escape_into(out, value, &[',', '=', ' ']);
}

fn escape_string_field(out: &mut String, value: &str) {
    out.push('"');
    escape_into(out, value, &['"']);
    out.push('"');
}

fn check_newlines(value: &str, location: &str) -> Result<(), ValidationError> {
    match value.chars().find(|c| *c == '\n' || *c == '\r') {
        Some(character) => Err(ValidationError::UnsupportedCharacter {
            location: location.to_string(),
            character,
        }),
        None => Ok(()),
    }
}

fn validate_for_line_protocol(record: &MetricRecord) -> Result<i64, ValidationError> {
    record.validate()?;

    check_newlines(&record.measurement, "measurement")?;
    // a line starting with '#' is a comment to the server
    if record.measurement.starts_with('#') {
        return Err(ValidationError::UnsupportedCharacter {
            location: "measurement".to_string(),
            character: '#',
        });
    }
    for (key, value) in &record.tags {
        check_newlines(key, "tag key")?;
        check_newlines(value, &format!("tag '{key}'"))?;
    }
    for (key, value) in &record.fields {
        check_newlines(key, "field key")?;
        if let FieldValue::String(s) = value {
            check_newlines(s, &format!("field '{key}'"))?;
        }
    }

    record
        .timestamp
        .timestamp_nanos_opt()
        .ok_or(ValidationError::TimestampOutOfRange(record.timestamp))
}

/// Render a single record as one line (without trailing newline)
pub fn encode_record(record: &MetricRecord) -> Result<String, ValidationError> {
    let timestamp = validate_for_line_protocol(record)?;

    let mut line = String::with_capacity(64);
    escape_measurement(&mut line, &record.measurement);

    // Empty tag values are not representable, so the tag is omitted
    for (key, value) in record.tags.iter().filter(|(_, v)| !v.is_empty()) {
        line.push(',');
        escape_key(&mut line, key);
        line.push('=');
        escape_key(&mut line, value);
    }

    line.push(' ');
    for (i, (key, value)) in record.fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        escape_key(&mut line, key);
        line.push('=');
        match value {
            FieldValue::Boolean(b) => line.push_str(if *b { "true" } else { "false" }),
            FieldValue::Integer(v) => {
                line.push_str(&v.to_string());
                line.push('i');
            }
            FieldValue::Float(v) => line.push_str(&v.to_string()),
            FieldValue::String(s) => escape_string_field(&mut line, s),
        }
    }

    line.push(' ');
    line.push_str(&timestamp.to_string());

    Ok(line)
}

/// Render a batch, skipping and counting invalid records
pub fn encode_batch(batch: &[MetricRecord]) -> EncodedBatch {
    let mut encoded = EncodedBatch::default();

    for record in batch {
        match encode_record(record) {
            Ok(line) => {
                if encoded.written > 0 {
                    encoded.payload.push('\n');
                }
                encoded.payload.push_str(&line);
                encoded.written += 1;
            }
            Err(e) => {
                warn!("skipping invalid record for '{}': {}", record.measurement, e);
                encoded.skipped += 1;
            }
        }
    }

    encoded
}

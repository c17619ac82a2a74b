//! Metric records handed to the dispatcher by collectors
//!
//! A [`MetricRecord`] is the backend-agnostic unit of work: a measurement
//! name, indexed string tags, typed field values and a timestamp. Records
//! are validated by every adapter before serialization; invalid records are
//! skipped and counted, never written.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field keys coerced to integers before fan-out unless configured otherwise.
pub const DEFAULT_INTEGER_FIELDS: &[&str] = &[
    "progress_percent",
    "season",
    "episode",
    "media_index",
    "parent_media_index",
];

/// A typed scalar field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl FieldValue {
    /// Short type name used in logs and schema errors
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::String(_) => "string",
        }
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::String(_) => None,
        }
    }

    /// Integer view used by field coercion
    fn to_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            FieldValue::String(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
            }
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// One sample of one metric family
///
/// Tags and fields are kept in sorted maps so every backend sees them in
/// a stable order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Metric family name (e.g. "Tautulli")
    pub measurement: String,

    /// Indexed dimensions (server id, user, platform, ...)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Measured values
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,

    /// When the sample was taken; capture time if the collector left it out
    #[serde(default = "Utc::now", alias = "time")]
    pub timestamp: DateTime<Utc>,
}

/// Why a record was rejected
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The measurement name is empty or blank
    EmptyMeasurement,

    /// The record carries no fields
    NoFields,

    /// A tag or field key is empty
    EmptyKey,

    /// A key is used both as a tag and as a field
    TagFieldCollision(String),

    /// A float field is NaN or infinite
    NonFiniteField(String),

    /// The timestamp cannot be represented by the backend
    TimestampOutOfRange(DateTime<Utc>),

    /// A character the backend's wire format cannot carry
    UnsupportedCharacter { location: String, character: char },

    /// Label set no longer unique after name normalization
    DuplicateLabel(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyMeasurement => write!(f, "measurement name is empty"),
            ValidationError::NoFields => write!(f, "record has no fields"),
            ValidationError::EmptyKey => write!(f, "tag or field key is empty"),
            ValidationError::TagFieldCollision(key) => {
                write!(f, "key '{}' is used as both tag and field", key)
            }
            ValidationError::NonFiniteField(key) => {
                write!(f, "field '{}' is not a finite number", key)
            }
            ValidationError::TimestampOutOfRange(ts) => {
                write!(f, "timestamp {} is out of range", ts)
            }
            ValidationError::UnsupportedCharacter {
                location,
                character,
            } => write!(f, "unsupported character {:?} in {}", character, location),
            ValidationError::DuplicateLabel(name) => {
                write!(f, "duplicate label '{}' after normalization", name)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl MetricRecord {
    /// Create a record stamped with the current time
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check the backend-independent invariants of a record
    ///
    /// Every adapter calls this before applying its own wire-format checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.measurement.trim().is_empty() {
            return Err(ValidationError::EmptyMeasurement);
        }

        if self.fields.is_empty() {
            return Err(ValidationError::NoFields);
        }

        if self.tags.keys().chain(self.fields.keys()).any(|k| k.is_empty()) {
            return Err(ValidationError::EmptyKey);
        }

        if let Some(key) = self.tags.keys().find(|k| self.fields.contains_key(*k)) {
            return Err(ValidationError::TagFieldCollision(key.clone()));
        }

        for (key, value) in &self.fields {
            if matches!(value, FieldValue::Float(f) if !f.is_finite()) {
                return Err(ValidationError::NonFiniteField(key.clone()));
            }
        }

        Ok(())
    }

    /// Force the given field keys to integer values
    ///
    /// Floats are truncated and numeric strings parsed; values that cannot
    /// be converted are removed so the field keeps a single type across
    /// batches.
    pub fn coerce_integer_fields<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            let key = key.as_ref();
            let Some(value) = self.fields.get(key) else {
                continue;
            };

            match value.to_integer() {
                Some(int) => {
                    self.fields.insert(key.to_string(), FieldValue::Integer(int));
                }
                None => {
                    self.fields.remove(key);
                }
            }
        }
    }
}

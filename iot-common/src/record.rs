//! # Record
//!
//! Wire and storage shapes of sensor readings.
use serde::{Deserialize, Serialize, Serializer};

/// Marker stored in place of a field that could not be decoded.
pub const ERROR_MARKER: &str = "Error";
/// Marker stored in place of a field that decoded to a physically implausible value.
pub const MALFUNCTION_MARKER: &str = "IOT Malfunctions";

/// Column order of the persisted store. Part of the external contract.
pub const SINK_COLUMNS: [&str; 4] = ["timestamp", "device_id", "temperature", "humidity"];

/// A reading as emitted by the simulated data source.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct RawReading {
    pub device_id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: String,
}

/// The outcome of validating a single field.
///
/// Serializes to the value itself, or to the literal marker strings.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<T> {
    Valid(T),
    /// The field was missing or could not be coerced.
    Error,
    /// The field was coerced but lies outside the plausible range.
    Malfunction,
}

impl<T> FieldValue<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, FieldValue::Valid(_))
    }

    pub fn valid(&self) -> Option<&T> {
        match self {
            FieldValue::Valid(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: Serialize> FieldValue<T> {
    /// Render the field as a single CSV cell: strings unquoted, numbers in
    /// their JSON form, markers as their literal text.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Valid(value) => match serde_json::to_value(value) {
                Ok(serde_json::Value::String(s)) => s,
                Ok(other) => other.to_string(),
                Err(_) => ERROR_MARKER.to_owned(),
            },
            FieldValue::Error => ERROR_MARKER.to_owned(),
            FieldValue::Malfunction => MALFUNCTION_MARKER.to_owned(),
        }
    }
}

impl<T: Serialize> Serialize for FieldValue<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FieldValue::Valid(value) => value.serialize(serializer),
            FieldValue::Error => serializer.serialize_str(ERROR_MARKER),
            FieldValue::Malfunction => serializer.serialize_str(MALFUNCTION_MARKER),
        }
    }
}

/// A reading after per-field validation. All four fields are always present.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub timestamp: FieldValue<String>,
    pub temperature: FieldValue<f64>,
    pub humidity: FieldValue<f64>,
    pub device_id: FieldValue<i64>,
}

impl ValidatedRecord {
    /// The deduplication key, if the timestamp survived validation.
    pub fn dedup_key(&self) -> Option<&str> {
        self.timestamp.valid().map(String::as_str)
    }

    /// Cells in `SINK_COLUMNS` order.
    pub fn to_row(&self) -> [String; 4] {
        [
            self.timestamp.to_cell(),
            self.device_id.to_cell(),
            self.temperature.to_cell(),
            self.humidity.to_cell(),
        ]
    }
}

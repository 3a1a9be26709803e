//! # Normalizer
//!
//! Turns a raw broker payload into a `ValidatedRecord`.
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::ValidatedRecord;
use crate::validation::{parse_device_id, parse_humidity, parse_temperature, parse_timestamp};

/// A message-level failure: nothing in the payload can be trusted.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is a json {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Decode a payload and validate its four fields independently.
///
/// Field failures never fail the call: a bad temperature still yields a
/// record with whatever timestamp could be extracted.
pub fn normalize(payload: &[u8]) -> Result<ValidatedRecord, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let object = match serde_json::from_str::<Value>(text)? {
        Value::Object(object) => object,
        other => return Err(DecodeError::NotAnObject(json_kind(&other))),
    };

    Ok(validate_object(&object))
}

fn validate_object(object: &Map<String, Value>) -> ValidatedRecord {
    ValidatedRecord {
        timestamp: parse_timestamp(object.get("timestamp")),
        temperature: parse_temperature(object.get("temperature")),
        humidity: parse_humidity(object.get("humidity")),
        device_id: parse_device_id(object.get("device_id")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;

    #[test]
    fn test_normalize_valid_payload() {
        let record = normalize(
            br#"{"device_id":1,"temperature":950,"humidity":5,"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .expect("payload should decode");

        assert_eq!(
            record,
            ValidatedRecord {
                timestamp: FieldValue::Valid("2024-01-01T00:00:00+00:00".to_owned()),
                temperature: FieldValue::Valid(950.0),
                humidity: FieldValue::Valid(5.0),
                device_id: FieldValue::Valid(1),
            }
        );
    }

    #[test]
    fn test_field_failures_are_independent() {
        let record = normalize(
            br#"{"device_id":"abc","temperature":"warm","humidity":500,"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .expect("payload should decode");

        assert_eq!(
            record.timestamp,
            FieldValue::Valid("2024-01-01T00:00:00+00:00".to_owned())
        );
        assert_eq!(record.temperature, FieldValue::Error);
        assert_eq!(record.humidity, FieldValue::Malfunction);
        assert_eq!(record.device_id, FieldValue::Error);
    }

    #[test]
    fn test_missing_keys_become_errors() {
        let record = normalize(b"{}").expect("empty object should decode");

        assert_eq!(record.timestamp, FieldValue::Error);
        assert_eq!(record.temperature, FieldValue::Error);
        assert_eq!(record.humidity, FieldValue::Error);
        assert_eq!(record.device_id, FieldValue::Error);
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        assert!(matches!(normalize(b"{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(normalize(&[0xff, 0xfe]), Err(DecodeError::Utf8(_))));
        assert!(matches!(
            normalize(b"[1, 2, 3]"),
            Err(DecodeError::NotAnObject("array"))
        ));
        assert!(matches!(
            normalize(b"\"Error in Connection\""),
            Err(DecodeError::NotAnObject("string"))
        ));
    }
}

//! Tagged-union parse step for duck-typed broker payloads.
//!
//! Telemetry publishers are inconsistent: the scale node sends bare JSON
//! numbers, older firmware sends numeric strings, and the HMI wraps values
//! in small objects (`{"weight": 3.2}`, `{"target": 70}`). Every validator
//! first classifies the raw text into a [`ScalarPayload`] and only then
//! extracts a number, so the duck typing is confined to this one module.

use pourlink_types::BridgeError;
use serde_json::{Map, Value};

/// The three accepted payload shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarPayload {
    /// A bare JSON number: `12.5`.
    Number(f64),
    /// A bare string, possibly numeric: `"12.5"` or unquoted wire text.
    Text(String),
    /// A JSON object carrying the value under a known key.
    Object(Map<String, Value>),
}

impl ScalarPayload {
    /// Classify raw wire text into one of the accepted shapes.
    ///
    /// Text that is not valid JSON is treated as a bare string scalar (the
    /// connector already strips the surrounding quotes of string payloads).
    pub fn classify(raw: &str) -> Result<Self, BridgeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::Validation("empty payload".to_string()));
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Number(n)) => n
                .as_f64()
                .map(ScalarPayload::Number)
                .ok_or_else(|| BridgeError::Validation("non-finite number".to_string())),
            Ok(Value::String(s)) => Ok(ScalarPayload::Text(s)),
            Ok(Value::Object(map)) => Ok(ScalarPayload::Object(map)),
            Ok(other) => Err(BridgeError::Validation(format!(
                "unsupported payload shape: {other}"
            ))),
            Err(_) => Ok(ScalarPayload::Text(trimmed.to_string())),
        }
    }

    /// Extract the numeric value, looking up `keys` in order for object
    /// payloads.
    pub fn numeric(&self, keys: &[&str]) -> Result<f64, BridgeError> {
        match self {
            ScalarPayload::Number(n) => Ok(*n),
            ScalarPayload::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                BridgeError::Validation(format!("non-numeric payload: {s:?}"))
            }),
            ScalarPayload::Object(map) => {
                for key in keys {
                    match map.get(*key) {
                        Some(Value::Number(n)) => {
                            return n.as_f64().ok_or_else(|| {
                                BridgeError::Validation("non-finite number".to_string())
                            });
                        }
                        Some(Value::String(s)) => {
                            return s.trim().parse::<f64>().map_err(|_| {
                                BridgeError::Validation(format!(
                                    "non-numeric value for key {key:?}: {s:?}"
                                ))
                            });
                        }
                        Some(other) => {
                            return Err(BridgeError::Validation(format!(
                                "unsupported value for key {key:?}: {other}"
                            )));
                        }
                        None => continue,
                    }
                }
                Err(BridgeError::Validation(format!(
                    "object payload has none of the keys {keys:?}"
                )))
            }
        }
    }

    /// Extract a short string code (robot event payloads), looking up `keys`
    /// in order for object payloads. Integer codes are rendered as decimal.
    pub fn code(&self, keys: &[&str]) -> Result<String, BridgeError> {
        match self {
            ScalarPayload::Number(n) => {
                if n.fract() == 0.0 {
                    Ok(format!("{}", *n as i64))
                } else {
                    Err(BridgeError::Validation(format!("non-integer code: {n}")))
                }
            }
            ScalarPayload::Text(s) => Ok(s.trim().to_string()),
            ScalarPayload::Object(map) => {
                for key in keys {
                    match map.get(*key) {
                        Some(Value::String(s)) => return Ok(s.trim().to_string()),
                        Some(Value::Number(n)) if n.is_i64() => {
                            return Ok(n.to_string());
                        }
                        Some(other) => {
                            return Err(BridgeError::Validation(format!(
                                "unsupported code for key {key:?}: {other}"
                            )));
                        }
                        None => continue,
                    }
                }
                Err(BridgeError::Validation(format!(
                    "object payload has none of the keys {keys:?}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_classified_and_extracted() {
        let payload = ScalarPayload::classify("12.5").unwrap();
        assert_eq!(payload, ScalarPayload::Number(12.5));
        assert!((payload.numeric(&["weight"]).unwrap() - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn numeric_string_is_extracted() {
        let payload = ScalarPayload::classify(r#""42.0""#).unwrap();
        assert!((payload.numeric(&["value"]).unwrap() - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unquoted_wire_text_falls_back_to_text() {
        // The connector delivers bare string scalars without quotes.
        let payload = ScalarPayload::classify("3.7").unwrap();
        assert!((payload.numeric(&[]).unwrap() - 3.7).abs() < f64::EPSILON);
    }

    #[test]
    fn object_payload_uses_key_order() {
        let payload = ScalarPayload::classify(r#"{"value": 1.0, "weight": 2.0}"#).unwrap();
        assert!((payload.numeric(&["weight", "value"]).unwrap() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn object_with_string_value_parses() {
        let payload = ScalarPayload::classify(r#"{"target": "70.5"}"#).unwrap();
        assert!((payload.numeric(&["target"]).unwrap() - 70.5).abs() < f64::EPSILON);
    }

    #[test]
    fn object_without_known_key_is_rejected() {
        let payload = ScalarPayload::classify(r#"{"mass": 3}"#).unwrap();
        assert!(payload.numeric(&["weight", "value"]).is_err());
    }

    #[test]
    fn non_numeric_text_is_rejected() {
        let payload = ScalarPayload::classify("hello").unwrap();
        assert!(matches!(
            payload.numeric(&[]),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn arrays_are_rejected_at_classification() {
        assert!(ScalarPayload::classify("[1, 2, 3]").is_err());
        assert!(ScalarPayload::classify("").is_err());
    }

    #[test]
    fn event_code_from_object_and_scalar() {
        let obj = ScalarPayload::classify(r#"{"event": "1"}"#).unwrap();
        assert_eq!(obj.code(&["event"]).unwrap(), "1");

        let num = ScalarPayload::classify("2").unwrap();
        assert_eq!(num.code(&["event"]).unwrap(), "2");

        let text = ScalarPayload::classify(r#""5""#).unwrap();
        assert_eq!(text.code(&["event"]).unwrap(), "5");
    }
}

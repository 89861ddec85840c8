//! Typed variable values and their wire encodings.
//!
//! Variable reads are driven by the type declared at registration: the
//! callback's value is encoded type-directed, not by inspection.

use crate::core::{CallbackError, MAX_PAYLOAD_LENGTH};

/// Type declared when a variable is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Encoded as a single 0/1 byte.
    Bool,
    /// Encoded as a big-endian i32.
    Int,
    /// Encoded as a big-endian IEEE-754 double.
    Double,
    /// Encoded as UTF-8 bytes.
    String,
    /// Encoded as the UTF-8 JSON serialization.
    Json,
}

impl VariableKind {
    /// Name used in the device descriptor.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int32",
            Self::Double => "double",
            Self::String => "string",
            Self::Json => "json",
        }
    }
}

/// A value produced by a variable callback.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    /// Boolean value.
    Bool(bool),
    /// 32-bit integer value.
    Int(i32),
    /// Double-precision value.
    Double(f64),
    /// Text value.
    String(String),
    /// Arbitrary JSON value.
    Json(serde_json::Value),
}

impl VariableValue {
    /// Encode per the declared kind.
    ///
    /// String and JSON payloads longer than the 622-byte limit are rejected;
    /// numeric kinds accept widening from narrower variants.
    pub fn encode(&self, declared: VariableKind) -> Result<Vec<u8>, CallbackError> {
        match (declared, self) {
            (VariableKind::Bool, Self::Bool(b)) => Ok(vec![u8::from(*b)]),
            (VariableKind::Int, Self::Int(i)) => Ok(i.to_be_bytes().to_vec()),
            (VariableKind::Int, Self::Bool(b)) => Ok(i32::from(*b).to_be_bytes().to_vec()),
            (VariableKind::Double, Self::Double(d)) => Ok(d.to_be_bytes().to_vec()),
            (VariableKind::Double, Self::Int(i)) => Ok(f64::from(*i).to_be_bytes().to_vec()),
            (VariableKind::String, Self::String(s)) => bounded(s.as_bytes().to_vec()),
            (VariableKind::Json, value) => {
                let json = match value {
                    Self::Json(v) => v.clone(),
                    Self::Bool(b) => serde_json::Value::from(*b),
                    Self::Int(i) => serde_json::Value::from(*i),
                    Self::Double(d) => serde_json::Value::from(*d),
                    Self::String(s) => serde_json::Value::from(s.clone()),
                };
                let bytes = serde_json::to_vec(&json)
                    .map_err(|e| CallbackError::new(format!("json encode: {e}")))?;
                bounded(bytes)
            }
            (declared, value) => Err(CallbackError::new(format!(
                "variable value {value:?} does not match declared type {}",
                declared.as_str()
            ))),
        }
    }
}

fn bounded(bytes: Vec<u8>) -> Result<Vec<u8>, CallbackError> {
    if bytes.len() > MAX_PAYLOAD_LENGTH {
        return Err(CallbackError::new(format!(
            "encoded variable exceeds {MAX_PAYLOAD_LENGTH} bytes"
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_i32(bytes: &[u8]) -> i32 {
        i32::from_be_bytes(bytes.try_into().unwrap())
    }

    fn decode_f64(bytes: &[u8]) -> f64 {
        f64::from_be_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn round_trips_every_kind() {
        assert_eq!(
            VariableValue::Bool(true).encode(VariableKind::Bool).unwrap(),
            vec![1]
        );
        assert_eq!(
            VariableValue::Bool(false)
                .encode(VariableKind::Bool)
                .unwrap(),
            vec![0]
        );

        let n = VariableValue::Int(-7).encode(VariableKind::Int).unwrap();
        assert_eq!(decode_i32(&n), -7);

        let d = VariableValue::Double(2.5)
            .encode(VariableKind::Double)
            .unwrap();
        assert_eq!(decode_f64(&d), 2.5);

        let s = VariableValue::String("caffè".into())
            .encode(VariableKind::String)
            .unwrap();
        assert_eq!(String::from_utf8(s).unwrap(), "caffè");

        let j = VariableValue::Json(serde_json::json!({"a": [1, 2]}))
            .encode(VariableKind::Json)
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&j).unwrap(),
            serde_json::json!({"a": [1, 2]})
        );
    }

    #[test]
    fn widens_numeric_values() {
        let d = VariableValue::Int(3).encode(VariableKind::Double).unwrap();
        assert_eq!(decode_f64(&d), 3.0);
    }

    #[test]
    fn rejects_mismatched_kinds() {
        assert!(VariableValue::String("x".into())
            .encode(VariableKind::Int)
            .is_err());
    }

    #[test]
    fn caps_string_and_json_payloads() {
        let long = "x".repeat(MAX_PAYLOAD_LENGTH + 1);
        assert!(VariableValue::String(long.clone())
            .encode(VariableKind::String)
            .is_err());
        assert!(VariableValue::Json(serde_json::Value::from(long))
            .encode(VariableKind::Json)
            .is_err());

        let exact = "x".repeat(MAX_PAYLOAD_LENGTH);
        assert!(VariableValue::String(exact)
            .encode(VariableKind::String)
            .is_ok());
    }
}

//! Element value encoding.
//!
//! Element payloads cross the stream as raw bytes. Callers can hand the
//! producer pre-encoded bytes (passed through untouched) or a structured
//! value, which the stream's [`ValueEncoder`] turns into bytes at send
//! time. The default encoder emits compact JSON text.

use bytes::Bytes;
use serde::Serialize;

use crate::error::BusError;

/// Encodes structured element values into their transportable bytes.
///
/// Plugged into the bus via [`Bus::with_encoder`](crate::Bus::with_encoder);
/// every stream created for that bus inherits it. Encoding failures are
/// returned from the offending send and leave the stream state untouched.
pub trait ValueEncoder: Send + Sync {
    fn encode(&self, value: &serde_json::Value) -> anyhow::Result<Bytes>;
}

/// Default encoder: compact JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl ValueEncoder for JsonEncoder {
    fn encode(&self, value: &serde_json::Value) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

/// A value to send as one section element.
///
/// `Empty` makes optional values uniform at call sites: sending it is a
/// success no-op that produces no element.
#[derive(Debug, Clone)]
pub enum ElementValue {
    /// No value; sending it does nothing and succeeds.
    Empty,
    /// Pre-encoded payload, passed through untouched.
    Bytes(Bytes),
    /// Structured value, encoded by the stream's encoder on send.
    Value(serde_json::Value),
}

impl ElementValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, ElementValue::Empty)
    }

    /// Bridge an arbitrary serializable value into an element value.
    pub fn serialize<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(ElementValue::Value)
    }

    pub(crate) fn encode_with(self, encoder: &dyn ValueEncoder) -> Result<Bytes, BusError> {
        match self {
            // Callers skip empty values before encoding.
            ElementValue::Empty => Ok(Bytes::new()),
            ElementValue::Bytes(bytes) => Ok(bytes),
            ElementValue::Value(value) => encoder.encode(&value).map_err(BusError::Encoding),
        }
    }
}

impl From<serde_json::Value> for ElementValue {
    fn from(value: serde_json::Value) -> Self {
        ElementValue::Value(value)
    }
}

impl From<Bytes> for ElementValue {
    fn from(value: Bytes) -> Self {
        ElementValue::Bytes(value)
    }
}

impl From<Vec<u8>> for ElementValue {
    fn from(value: Vec<u8>) -> Self {
        ElementValue::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for ElementValue {
    fn from(value: &[u8]) -> Self {
        ElementValue::Bytes(Bytes::copy_from_slice(value))
    }
}

impl<const N: usize> From<&[u8; N]> for ElementValue {
    fn from(value: &[u8; N]) -> Self {
        ElementValue::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<&str> for ElementValue {
    fn from(value: &str) -> Self {
        ElementValue::Value(serde_json::Value::String(value.to_owned()))
    }
}

impl From<String> for ElementValue {
    fn from(value: String) -> Self {
        ElementValue::Value(serde_json::Value::String(value))
    }
}

impl From<bool> for ElementValue {
    fn from(value: bool) -> Self {
        ElementValue::Value(serde_json::Value::from(value))
    }
}

impl From<i32> for ElementValue {
    fn from(value: i32) -> Self {
        ElementValue::Value(serde_json::Value::from(value))
    }
}

impl From<i64> for ElementValue {
    fn from(value: i64) -> Self {
        ElementValue::Value(serde_json::Value::from(value))
    }
}

impl From<u64> for ElementValue {
    fn from(value: u64) -> Self {
        ElementValue::Value(serde_json::Value::from(value))
    }
}

impl From<f64> for ElementValue {
    fn from(value: f64) -> Self {
        ElementValue::Value(serde_json::Value::from(value))
    }
}

impl<T: Into<ElementValue>> From<Option<T>> for ElementValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => ElementValue::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_encoder_emits_compact_json() {
        let value = serde_json::json!({"id": 100, "name": "Cola"});
        let bytes = JsonEncoder.encode(&value).unwrap();
        assert_eq!(bytes, r#"{"id":100,"name":"Cola"}"#);
    }

    #[test]
    fn strings_encode_as_json_strings() {
        let bytes = ElementValue::from("element1")
            .encode_with(&JsonEncoder)
            .unwrap();
        assert_eq!(bytes, r#""element1""#);
    }

    #[test]
    fn byte_values_pass_through_unencoded() {
        let bytes = ElementValue::from(&b"{\"x\":52,\"y\":89}"[..])
            .encode_with(&JsonEncoder)
            .unwrap();
        assert_eq!(bytes, r#"{"x":52,"y":89}"#);
    }

    #[test]
    fn none_converts_to_empty() {
        assert!(ElementValue::from(Option::<&str>::None).is_empty());
        assert!(!ElementValue::from(Some("value")).is_empty());
    }

    #[test]
    fn serialize_bridges_arbitrary_types() {
        #[derive(Serialize)]
        struct Article {
            id: i64,
            name: String,
        }

        let article = Article {
            id: 100,
            name: "Cola".to_owned(),
        };
        let value = ElementValue::serialize(&article).unwrap();
        let bytes = value.encode_with(&JsonEncoder).unwrap();
        assert_eq!(bytes, r#"{"id":100,"name":"Cola"}"#);
    }
}

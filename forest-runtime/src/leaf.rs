//! The [`Leaf`] envelope: the only data currency between components.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Typed message envelope passed between components over Wind.
///
/// Immutable once constructed; shared between subscribers as `Arc<Leaf>`.
/// The payload is opaque bytes, conventionally JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    pub subject: String,
    #[serde(
        serialize_with = "serialize_payload",
        deserialize_with = "deserialize_payload"
    )]
    pub payload: Vec<u8>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Leaf {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>, source: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    /// Parses the payload as JSON. Payloads are conventionally JSON but the
    /// envelope does not require it, so this is fallible.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

pub(crate) fn serialize_payload<S: Serializer>(
    payload: &[u8],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(payload))
}

pub(crate) fn deserialize_payload<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64.decode(encoded.as_bytes()).map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::Leaf;

    #[test]
    fn new_stamps_source_and_subject() {
        let leaf = Leaf::new("payment.completed", b"{}".to_vec(), "payment-tree");
        assert_eq!(leaf.subject, "payment.completed");
        assert_eq!(leaf.source, "payment-tree");
        assert_eq!(leaf.payload, b"{}");
    }

    #[test]
    fn wire_roundtrip_preserves_binary_payload() {
        let leaf = Leaf::new("a.b", vec![0u8, 159, 146, 150], "src");
        let encoded = serde_json::to_string(&leaf).expect("serialize leaf");
        let decoded: Leaf = serde_json::from_str(&encoded).expect("deserialize leaf");
        assert_eq!(decoded, leaf);
    }

    #[test]
    fn payload_json_parses_json_payloads() {
        let leaf = Leaf::new("a.b", br#"{"amount":150.0}"#.to_vec(), "src");
        let value = leaf.payload_json().expect("json payload");
        assert_eq!(value["amount"], 150.0);
        let binary = Leaf::new("a.b", vec![0xff], "src");
        assert!(binary.payload_json().is_err());
    }
}

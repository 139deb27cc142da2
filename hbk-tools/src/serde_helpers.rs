//! Serde adapters for binary fields in JSON documents.

/// Serialize `Vec<u8>`/`[u8]` fields as base64 strings.
///
/// ```text
/// #[serde(with = "hbk_tools::serde_helpers::bytes_as_base64")]
/// data: Vec<u8>,
/// ```
pub mod bytes_as_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(data: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&base64::encode(data.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        base64::decode(text).map_err(serde::de::Error::custom)
    }
}

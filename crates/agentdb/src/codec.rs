//! Record payload encoding.
//!
//! Every record is stored as JSON. A payload that fails to decode is logged
//! together with its raw bytes before the error is returned.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::error;

use crate::error::{StateError, StateResult};

/// A persisted entity.
///
/// `from_bytes` is the single decode path for the entity, so types with
/// older payload shapes override it to migrate on read.
pub trait Record: Serialize + DeserializeOwned + Sized {
    fn from_bytes(bucket: &str, key: &str, bytes: &[u8]) -> StateResult<Self> {
        decode(bucket, key, bytes)
    }

    fn to_bytes(&self) -> StateResult<Vec<u8>> {
        encode(self)
    }
}

pub fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bucket: &str, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| decode_failure(bucket, key, bytes, e))
}

pub(crate) fn decode_failure(
    bucket: &str,
    key: &str,
    bytes: &[u8],
    err: impl std::fmt::Display,
) -> StateError {
    let raw = String::from_utf8_lossy(bytes);
    error!(bucket, key, %raw, "unable to deserialize record: {err}");
    StateError::Deserialize(format!("{bucket}/{key}: {err}"))
}

/// Field deserializer that reads an explicit `null` as the type's default.
/// Older payloads wrote `null` for empty lists and maps.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode a UTF-8 payload stored without JSON framing.
pub fn decode_raw_string(bucket: &str, key: &str, bytes: &[u8]) -> StateResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| decode_failure(bucket, key, bytes, e))
}

//! The payload (de)serialization collaborator. Pluggable per command/executor instance,
//! generic rather than boxed for the same reason as [`crate::transport::PubSubClient`].

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("content-type `{0}` is not supported by this codec")]
    UnsupportedContentType(String),
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encodes and decodes command request/response payloads.
pub trait Codec<T>: Send + Sync + 'static {
    fn content_type(&self) -> &'static str;
    fn payload_format_indicator(&self) -> u8;
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8], content_type: Option<&str>) -> Result<T, CodecError>;
}

/// Reference [`Codec`] implementation over `serde_json`, used by the crate's own tests
/// and available to downstream users as a default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn payload_format_indicator(&self) -> u8 {
        1
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    fn decode(&self, bytes: &[u8], content_type: Option<&str>) -> Result<T, CodecError> {
        if let Some(content_type) = content_type {
            if content_type != self.content_type() {
                return Err(CodecError::UnsupportedContentType(content_type.to_string()));
            }
        }
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

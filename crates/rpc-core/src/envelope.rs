//! Reserved envelope header names, status codes, protocol version negotiation, and the
//! status-code <-> error-kind mapping used by both the invoker and the executor.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorContext, RpcError};
use crate::hlc::HlcTimestamp;

pub const HEADER_PROTOCOL_VERSION: &str = "__protVer";
pub const HEADER_TIMESTAMP: &str = "__ts";
pub const HEADER_SOURCE_ID: &str = "__srcId";
pub const HEADER_STATUS: &str = "__stat";
pub const HEADER_STATUS_MESSAGE: &str = "__stMsg";
pub const HEADER_IS_APPLICATION_ERROR: &str = "__apErr";
pub const HEADER_INVALID_PROPERTY_NAME: &str = "__propName";
pub const HEADER_INVALID_PROPERTY_VALUE: &str = "__propVal";
pub const HEADER_REQUESTED_PROTOCOL_VERSION: &str = "__requestProtVer";
pub const HEADER_SUPPORTED_MAJOR_PROTOCOL_VERSIONS: &str = "__supProtMajVer";
pub const HEADER_PARTITION: &str = "$partition";

const RESERVED_PREFIX: &str = "__";

pub const SUPPORTED_MAJOR_VERSION: u32 = 1;
pub const CURRENT_PROTOCOL_VERSION: &str = "1.0";

/// True when `name` is one of the `__`-prefixed reserved headers (or `$partition`) and must
/// not be surfaced as application metadata.
pub fn is_reserved_header(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || name == HEADER_PARTITION
}

/// Splits raw user-properties into reserved headers (kept aside) and application metadata.
pub fn split_headers(raw: &[(String, String)]) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut reserved = HashMap::new();
    let mut application = HashMap::new();
    for (name, value) in raw {
        if is_reserved_header(name) {
            reserved.insert(name.clone(), value.clone());
        } else {
            application.insert(name.clone(), value.clone());
        }
    }
    (reserved, application)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    NoContent = 204,
    BadRequest = 400,
    RequestTimeout = 408,
    UnsupportedMediaType = 415,
    UnprocessableContent = 422,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    NotSupportedVersion = 505,
}

#[derive(Debug, Error)]
#[error("`{0}` is not a recognized status code")]
pub struct UnknownStatusCode(pub u16);

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Result<Self, UnknownStatusCode> {
        Ok(match value {
            200 => StatusCode::Ok,
            204 => StatusCode::NoContent,
            400 => StatusCode::BadRequest,
            408 => StatusCode::RequestTimeout,
            415 => StatusCode::UnsupportedMediaType,
            422 => StatusCode::UnprocessableContent,
            500 => StatusCode::InternalServerError,
            503 => StatusCode::ServiceUnavailable,
            505 => StatusCode::NotSupportedVersion,
            other => return Err(UnknownStatusCode(other)),
        })
    }

    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::NoContent)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// The fields a received error response carries, as parsed off the envelope headers.
#[derive(Debug, Clone, Default)]
pub struct StatusDetails {
    pub is_application_error: bool,
    pub property_name: Option<String>,
    pub property_value: Option<String>,
    pub requested_protocol_version: Option<String>,
    pub supported_major_protocol_versions: Vec<u32>,
}

/// Maps a received status code plus its accompanying headers to the matching [`RpcError`],
/// per the executor/invoker status-code classification rules. Pure function: no I/O.
pub fn map_status_to_error(status: StatusCode, details: &StatusDetails, context: ErrorContext) -> RpcError {
    match status {
        StatusCode::Ok | StatusCode::NoContent => {
            unreachable!("success statuses never map to an error")
        }
        StatusCode::BadRequest => {
            if let Some(name) = details.property_name.clone() {
                let value = details.property_value.clone();
                RpcError::HeaderInvalid {
                    header_name: name,
                    header_value: value,
                    context,
                }
            } else {
                RpcError::HeaderMissing {
                    header_name: "unknown".to_string(),
                    context,
                }
            }
        }
        StatusCode::RequestTimeout => RpcError::Timeout {
            timeout_name: "ExecutionTimeout",
            timeout_value: std::time::Duration::from_secs(0),
            context,
        },
        StatusCode::UnsupportedMediaType => RpcError::HeaderInvalid {
            header_name: "contentType".to_string(),
            header_value: details.property_value.clone(),
            context,
        },
        StatusCode::UnprocessableContent => RpcError::InvocationException {
            message: details
                .property_name
                .clone()
                .unwrap_or_else(|| "invocation rejected".to_string()),
            property_name: details.property_name.clone(),
            property_value: details.property_value.clone(),
            context,
        },
        StatusCode::InternalServerError => {
            if details.is_application_error {
                RpcError::ExecutionException {
                    message: "handler execution failed".to_string(),
                    context,
                }
            } else if details.property_name.is_some() {
                RpcError::InternalLogicError {
                    message: details.property_name.clone().unwrap_or_default(),
                    context,
                }
            } else {
                RpcError::UnknownError {
                    message: "internal server error".to_string(),
                    context,
                }
            }
        }
        StatusCode::ServiceUnavailable => RpcError::StateInvalid {
            message: "executor unavailable".to_string(),
            context,
        },
        StatusCode::NotSupportedVersion => RpcError::UnsupportedRequestVersion {
            protocol_version: details.requested_protocol_version.clone().unwrap_or_default(),
            supported_major_protocol_versions: details.supported_major_protocol_versions.clone(),
            context,
        },
    }
}

/// The inverse of [`map_status_to_error`]: used when an executor builds an error response
/// from a caught failure.
pub fn status_for_error(error: &RpcError) -> StatusCode {
    match error {
        RpcError::HeaderMissing { .. } => StatusCode::BadRequest,
        RpcError::HeaderInvalid { header_name, .. } if header_name == "contentType" => {
            StatusCode::UnsupportedMediaType
        }
        RpcError::HeaderInvalid { .. } => StatusCode::BadRequest,
        RpcError::PayloadInvalid { .. } => StatusCode::BadRequest,
        RpcError::Timeout { .. } => StatusCode::RequestTimeout,
        RpcError::InvocationException { .. } => StatusCode::UnprocessableContent,
        RpcError::ExecutionException { .. } => StatusCode::InternalServerError,
        RpcError::InternalLogicError { .. } => StatusCode::InternalServerError,
        RpcError::StateInvalid { .. } => StatusCode::ServiceUnavailable,
        RpcError::UnsupportedRequestVersion { .. } => StatusCode::NotSupportedVersion,
        _ => StatusCode::InternalServerError,
    }
}

/// A parsed "MAJOR.MINOR" protocol version header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Error)]
#[error("`{0}` is not a valid MAJOR.MINOR protocol version")]
pub struct ProtocolVersionError(pub String);

impl ProtocolVersion {
    pub fn parse(value: &str) -> Result<Self, ProtocolVersionError> {
        let mut parts = value.splitn(2, '.');
        let major = parts
            .next()
            .and_then(|part| part.parse().ok())
            .ok_or_else(|| ProtocolVersionError(value.to_string()))?;
        let minor = parts
            .next()
            .and_then(|part| part.parse().ok())
            .ok_or_else(|| ProtocolVersionError(value.to_string()))?;
        Ok(Self { major, minor })
    }

    /// Compatibility is major-only: two versions with the same major are interoperable
    /// regardless of minor.
    pub fn is_compatible_with(self, supported_majors: &[u32]) -> bool {
        supported_majors.contains(&self.major)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Correlation data as carried on the wire: 16 bytes, interpreted as a UUID.
pub fn encode_correlation(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

pub fn decode_correlation(bytes: &[u8]) -> Option<Uuid> {
    Uuid::from_slice(bytes).ok()
}

/// Stamps the standard headers (protocol version, timestamp, source id) onto an
/// outgoing message's user-properties list.
pub fn stamp_standard_headers(
    properties: &mut Vec<(String, String)>,
    source_id: &str,
    timestamp: &HlcTimestamp,
) {
    properties.push((HEADER_PROTOCOL_VERSION.to_string(), CURRENT_PROTOCOL_VERSION.to_string()));
    properties.push((HEADER_TIMESTAMP.to_string(), timestamp.encode()));
    properties.push((HEADER_SOURCE_ID.to_string(), source_id.to_string()));
}

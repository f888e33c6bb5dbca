use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::topic::TopicError;
use crate::transport::TransportError;

/// Command name and correlation id carried on every [`RpcError`] variant.
///
/// Pulled out of the variants themselves so each one only declares the fields
/// specific to its failure instead of repeating `command`/`correlation_id`.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub command: String,
    pub correlation_id: Option<uuid::Uuid>,
}

impl ErrorContext {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: uuid::Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the correlation id from raw wire bytes, best-effort: malformed bytes simply
    /// leave the field unset rather than failing the whole context.
    pub fn with_correlation_bytes(mut self, bytes: &[u8]) -> Self {
        self.correlation_id = uuid::Uuid::from_slice(bytes).ok();
        self
    }
}

/// Every failure surface the core can produce, mirroring the wire-level error
/// kinds rather than ad hoc strings.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("missing required header `{header_name}` ({context:?})")]
    HeaderMissing {
        header_name: String,
        context: ErrorContext,
    },

    #[error("invalid header `{header_name}` = {header_value:?} ({context:?})")]
    HeaderInvalid {
        header_name: String,
        header_value: Option<String>,
        context: ErrorContext,
    },

    #[error("payload could not be decoded ({context:?}): {source}")]
    PayloadInvalid {
        #[source]
        source: CodecError,
        context: ErrorContext,
    },

    #[error("command `{}` timed out after {timeout_value:?} ({context:?})", context.command)]
    Timeout {
        timeout_name: &'static str,
        timeout_value: Duration,
        context: ErrorContext,
    },

    #[error("command `{}` was cancelled ({context:?})", context.command)]
    Cancellation { context: ErrorContext },

    #[error("invalid configuration: {message}")]
    ConfigurationInvalid { message: String },

    #[error("invalid argument `{argument}`: {message}")]
    ArgumentInvalid { argument: &'static str, message: String },

    #[error("invalid state: {message} ({context:?})")]
    StateInvalid {
        message: String,
        context: ErrorContext,
    },

    #[error("internal logic error: {message} ({context:?})")]
    InternalLogicError {
        message: String,
        context: ErrorContext,
    },

    #[error("unknown error: {message} ({context:?})")]
    UnknownError {
        message: String,
        context: ErrorContext,
    },

    #[error("invocation rejected by handler: {message} ({context:?})")]
    InvocationException {
        message: String,
        property_name: Option<String>,
        property_value: Option<String>,
        context: ErrorContext,
    },

    #[error("handler execution failed: {message} ({context:?})")]
    ExecutionException {
        message: String,
        context: ErrorContext,
    },

    #[error("pub/sub transport error ({context:?}): {source}")]
    MqttError {
        #[source]
        source: TransportError,
        context: ErrorContext,
    },

    #[error("request protocol version {protocol_version} unsupported by executor ({context:?})")]
    UnsupportedRequestVersion {
        protocol_version: String,
        supported_major_protocol_versions: Vec<u32>,
        context: ErrorContext,
    },

    #[error("response protocol version {protocol_version} unsupported by invoker ({context:?})")]
    UnsupportedResponseVersion {
        protocol_version: String,
        context: ErrorContext,
    },
}

impl RpcError {
    pub fn context(&self) -> &ErrorContext {
        match self {
            RpcError::HeaderMissing { context, .. }
            | RpcError::HeaderInvalid { context, .. }
            | RpcError::PayloadInvalid { context, .. }
            | RpcError::Timeout { context, .. }
            | RpcError::Cancellation { context }
            | RpcError::StateInvalid { context, .. }
            | RpcError::InternalLogicError { context, .. }
            | RpcError::UnknownError { context, .. }
            | RpcError::InvocationException { context, .. }
            | RpcError::ExecutionException { context, .. }
            | RpcError::MqttError { context, .. }
            | RpcError::UnsupportedRequestVersion { context, .. }
            | RpcError::UnsupportedResponseVersion { context, .. } => context,
            RpcError::ConfigurationInvalid { .. } | RpcError::ArgumentInvalid { .. } => {
                static EMPTY: ErrorContext = ErrorContext {
                    command: String::new(),
                    correlation_id: None,
                };
                &EMPTY
            }
        }
    }

    pub fn is_application_error(&self) -> bool {
        matches!(self, RpcError::ExecutionException { .. })
    }
}

impl From<TopicError> for RpcError {
    fn from(source: TopicError) -> Self {
        RpcError::ArgumentInvalid {
            argument: "topic_pattern",
            message: source.to_string(),
        }
    }
}

//! The calling side of the RPC: builds requests, tracks pending calls by correlation
//! data, and resolves them on response, timeout, or cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::Codec;
use crate::config::InvokerConfig;
use crate::context::AppContext;
use crate::envelope::{
    decode_correlation, encode_correlation, map_status_to_error, split_headers, stamp_standard_headers,
    ProtocolVersion, StatusCode, StatusDetails, HEADER_INVALID_PROPERTY_NAME, HEADER_INVALID_PROPERTY_VALUE,
    HEADER_IS_APPLICATION_ERROR, HEADER_PROTOCOL_VERSION, HEADER_REQUESTED_PROTOCOL_VERSION, HEADER_STATUS,
    HEADER_SUPPORTED_MAJOR_PROTOCOL_VERSIONS, HEADER_TIMESTAMP, SUPPORTED_MAJOR_VERSION,
};
use crate::error::{ErrorContext, RpcError};
use crate::hlc::HlcTimestamp;
use crate::topic::TopicPattern;
use crate::transport::{PublishProperties, PubSubClient, Qos};

type PendingMap<Res> = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<Res, RpcError>>>>>;

/// An invoker for a single command. `Req`/`Res` are the command's request/response types;
/// `Client` is the bound pub/sub client; `Cd` is the payload codec.
pub struct Invoker<Client, Req, Res, Cd> {
    client: Arc<Client>,
    codec: Cd,
    context: AppContext,
    config: InvokerConfig,
    command_name: String,
    pending: PendingMap<Res>,
    response_filter: Mutex<Option<String>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    _req: std::marker::PhantomData<Req>,
}

impl<Client, Req, Res, Cd> Invoker<Client, Req, Res, Cd>
where
    Client: PubSubClient,
    Req: Send + 'static,
    Res: Send + 'static,
    Cd: Codec<Req> + Codec<Res> + Clone + 'static,
{
    pub fn new(
        client: Arc<Client>,
        codec: Cd,
        context: AppContext,
        config: InvokerConfig,
        command_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            codec,
            context,
            config,
            command_name: command_name.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            response_filter: Mutex::new(None),
            receive_task: Mutex::new(None),
            _req: std::marker::PhantomData,
        }
    }

    /// Subscribes once to the response-topic filter and starts the receive loop.
    pub async fn start(&self) -> Result<(), RpcError> {
        self.config.validate()?;
        let resolved = self.config.resolved_response_pattern(self.client.client_id())?;
        let filter = resolved.as_filter();

        // Unshared: this invoker is the sole subscriber on its response filter, so it never
        // needs to see its own publishes echoed back.
        let mut rx = self
            .client
            .subscribe(&filter, Qos::AtLeastOnce, true)
            .await
            .map_err(|source| RpcError::MqttError {
                source,
                context: ErrorContext::new(&self.command_name),
            })?;

        *self.response_filter.lock().await = Some(filter);

        let pending = Arc::clone(&self.pending);
        let codec = self.codec.clone();
        let context = self.context.clone();
        let command_name = self.command_name.clone();

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handle_response::<Req, Res, Cd>(message, &pending, &codec, &context, &command_name).await;
            }
        });
        *self.receive_task.lock().await = Some(handle);
        Ok(())
    }

    /// Unsubscribes, fails every outstanding pending call with `Cancellation`, and stops
    /// the receive loop.
    pub async fn close(&self) {
        if let Some(handle) = self.receive_task.lock().await.take() {
            handle.abort();
        }
        if let Some(filter) = self.response_filter.lock().await.take() {
            if let Err(error) = self.client.unsubscribe(&filter).await {
                warn!(?error, "failed to unsubscribe invoker response filter");
            }
        }
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(RpcError::Cancellation {
                context: ErrorContext::new(&self.command_name),
            }));
        }
    }

    /// Sends a request and awaits its response, or a timeout/cancellation/error.
    pub async fn invoke(
        &self,
        request_topic_pattern: &str,
        payload: Req,
        metadata: HashMap<String, String>,
        tokens: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Res, RpcError> {
        let timeout = clamp_timeout(timeout)?;
        let context = ErrorContext::new(&self.command_name);

        let request_pattern = TopicPattern::parse(request_topic_pattern)?;
        let request_topic = request_pattern.resolve(&tokens)?;

        let resolved_response = self.config.resolved_response_pattern(self.client.client_id())?;
        let mut response_tokens = tokens.clone();
        response_tokens
            .entry("clientId".to_string())
            .or_insert_with(|| self.client.client_id().to_string());
        let response_topic = resolved_response.resolve(&response_tokens)?;

        let correlation = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation, tx);

        let now = self.context.now().await;
        let mut user_properties = Vec::new();
        stamp_standard_headers(&mut user_properties, self.client.client_id(), &now);
        user_properties.extend(metadata);

        let encoded = Codec::<Req>::encode(&self.codec, &payload).map_err(|source| RpcError::PayloadInvalid {
            source,
            context: context.clone(),
        })?;

        let properties = PublishProperties {
            correlation_data: Some(encode_correlation(correlation)),
            response_topic: Some(response_topic),
            message_expiry: Some(timeout),
            content_type: Some(Codec::<Req>::content_type(&self.codec).to_string()),
            payload_format_indicator: Some(Codec::<Req>::payload_format_indicator(&self.codec)),
            user_properties,
        };

        if let Err(source) = self
            .client
            .publish(&request_topic, &encoded, Qos::AtLeastOnce, properties)
            .await
        {
            self.pending.lock().await.remove(&correlation);
            return Err(RpcError::MqttError {
                source,
                context: context.with_correlation(correlation),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&correlation);
                Err(RpcError::Cancellation {
                    context: context.with_correlation(correlation),
                })
            }
            Err(_) => {
                self.pending.lock().await.remove(&correlation);
                Err(RpcError::Timeout {
                    timeout_name: "invoke",
                    timeout_value: timeout,
                    context: context.with_correlation(correlation),
                })
            }
        }
    }
}

fn clamp_timeout(timeout: Duration) -> Result<Duration, RpcError> {
    if timeout < Duration::from_secs(1) || timeout.as_secs() > u32::MAX as u64 {
        return Err(RpcError::ArgumentInvalid {
            argument: "timeout",
            message: "timeout must be between 1 second and u32::MAX seconds".to_string(),
        });
    }
    let whole_seconds = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    Ok(Duration::from_secs(whole_seconds))
}

async fn handle_response<Req, Res, Cd>(
    message: crate::transport::IncomingMessage,
    pending: &PendingMap<Res>,
    codec: &Cd,
    context: &AppContext,
    command_name: &str,
) where
    Res: Send + 'static,
    Cd: Codec<Res>,
{
    let (ack, topic, payload, properties) = (message.ack, message.topic, message.payload, message.properties);

    let Some(correlation) = properties
        .correlation_data
        .as_deref()
        .and_then(decode_correlation)
    else {
        debug!(%topic, "response missing a parseable correlation id, ignoring");
        ack();
        return;
    };

    let mut pending_guard = pending.lock().await;
    let Some(sender) = pending_guard.remove(&correlation) else {
        drop(pending_guard);
        debug!(%correlation, "response correlation unknown to this invoker, ignoring");
        ack();
        return;
    };
    drop(pending_guard);

    let (reserved, _application) = split_headers(&properties.user_properties);
    let error_context = ErrorContext::new(command_name).with_correlation(correlation);

    // A response omitting the version header is conforming (only requests must carry it);
    // treat it as the lowest negotiated version instead of failing the call.
    let version_header = reserved
        .get(HEADER_PROTOCOL_VERSION)
        .cloned()
        .unwrap_or_else(|| crate::envelope::CURRENT_PROTOCOL_VERSION.to_string());
    let Ok(version) = ProtocolVersion::parse(&version_header) else {
        let _ = sender.send(Err(RpcError::UnsupportedResponseVersion {
            protocol_version: version_header.clone(),
            context: error_context,
        }));
        ack();
        return;
    };
    if !version.is_compatible_with(&[SUPPORTED_MAJOR_VERSION]) {
        let _ = sender.send(Err(RpcError::UnsupportedResponseVersion {
            protocol_version: version.to_string(),
            context: error_context,
        }));
        ack();
        return;
    }

    let Some(status_header) = reserved.get(HEADER_STATUS) else {
        let _ = sender.send(Err(RpcError::HeaderMissing {
            header_name: HEADER_STATUS.to_string(),
            context: error_context,
        }));
        ack();
        return;
    };
    let Ok(status_value) = status_header.parse::<u16>() else {
        let _ = sender.send(Err(RpcError::HeaderInvalid {
            header_name: HEADER_STATUS.to_string(),
            header_value: Some(status_header.clone()),
            context: error_context,
        }));
        ack();
        return;
    };
    let Ok(status) = StatusCode::from_u16(status_value) else {
        let _ = sender.send(Err(RpcError::HeaderInvalid {
            header_name: HEADER_STATUS.to_string(),
            header_value: Some(status_header.clone()),
            context: error_context,
        }));
        ack();
        return;
    };

    if let Some(timestamp_header) = reserved.get(HEADER_TIMESTAMP) {
        if let Ok(remote_ts) = HlcTimestamp::decode(timestamp_header) {
            if let Err(error) = context.merge(&remote_ts).await {
                warn!(?error, "failed to merge response timestamp into local clock");
            }
        }
    }

    if status.is_success() {
        let content_type = properties.content_type.as_deref();
        match Codec::<Res>::decode(codec, &payload, content_type) {
            Ok(response) => {
                let _ = sender.send(Ok(response));
            }
            Err(source) => {
                let _ = sender.send(Err(RpcError::PayloadInvalid {
                    source,
                    context: error_context,
                }));
            }
        }
        ack();
        return;
    }

    let details = StatusDetails {
        is_application_error: reserved
            .get(HEADER_IS_APPLICATION_ERROR)
            .map(|value| value == "true")
            .unwrap_or(false),
        property_name: reserved.get(HEADER_INVALID_PROPERTY_NAME).cloned(),
        property_value: reserved.get(HEADER_INVALID_PROPERTY_VALUE).cloned(),
        requested_protocol_version: reserved.get(HEADER_REQUESTED_PROTOCOL_VERSION).cloned(),
        supported_major_protocol_versions: reserved
            .get(HEADER_SUPPORTED_MAJOR_PROTOCOL_VERSIONS)
            .map(|value| value.split(' ').filter_map(|part| part.parse().ok()).collect())
            .unwrap_or_default(),
    };
    let _ = sender.send(Err(map_status_to_error(status, &details, error_context)));
    ack();
}

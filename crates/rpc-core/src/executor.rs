//! The handling side of the RPC: validates inbound requests, checks the response cache,
//! dispatches the handler with a bounded deadline, and publishes (and caches) the result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheCostInputs, CacheKey, CachedMessage, ResponseCache, ResponseCacheConfig};
use crate::codec::Codec;
use crate::config::ExecutorConfig;
use crate::context::AppContext;
use crate::dispatch::DispatchRegistry;
use crate::envelope::{
    stamp_standard_headers, HEADER_INVALID_PROPERTY_NAME, HEADER_INVALID_PROPERTY_VALUE,
    HEADER_IS_APPLICATION_ERROR, HEADER_PROTOCOL_VERSION, HEADER_REQUESTED_PROTOCOL_VERSION, HEADER_STATUS,
    HEADER_STATUS_MESSAGE, HEADER_SUPPORTED_MAJOR_PROTOCOL_VERSIONS, ProtocolVersion, StatusCode,
    SUPPORTED_MAJOR_VERSION,
};
use crate::error::{ErrorContext, RpcError};
use crate::handler::{Handler, HandlerOutcome};
use crate::topic::TopicPattern;
use crate::transport::{IncomingMessage, PublishProperties, PubSubClient, Qos};

/// An executor for a single command. `Req`/`Res` are the command's request/response
/// types; `Client` is the bound pub/sub client; `Cd` is the payload codec; `H` is the
/// user-supplied handler.
pub struct Executor<Client, Req, Res, Cd, H> {
    client: Arc<Client>,
    codec: Cd,
    context: AppContext,
    config: ExecutorConfig,
    command_name: String,
    cache: Arc<ResponseCache>,
    dispatch: Arc<DispatchRegistry>,
    handler: Arc<H>,
    request_filter: Mutex<Option<String>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    _types: std::marker::PhantomData<(Req, Res)>,
}

impl<Client, Req, Res, Cd, H> Executor<Client, Req, Res, Cd, H>
where
    Client: PubSubClient,
    Req: Send + 'static,
    Res: Send + 'static,
    Cd: Codec<Req> + Codec<Res> + Clone + Send + Sync + 'static,
    H: Handler<Req, Res>,
{
    pub fn new(
        client: Arc<Client>,
        codec: Cd,
        context: AppContext,
        config: ExecutorConfig,
        command_name: impl Into<String>,
        handler: H,
    ) -> Self {
        Self {
            client,
            codec,
            context,
            config,
            command_name: command_name.into(),
            cache: Arc::new(ResponseCache::new(ResponseCacheConfig::default())),
            dispatch: Arc::new(DispatchRegistry::new()),
            handler: Arc::new(handler),
            request_filter: Mutex::new(None),
            receive_task: Mutex::new(None),
            _types: std::marker::PhantomData,
        }
    }

    pub async fn start(&self) -> Result<(), RpcError> {
        self.config.validate()?;
        let pattern = TopicPattern::parse(&self.config.request_topic_pattern)?;
        let shared = self.config.shared_subscription_group.is_some();
        let filter = match &self.config.shared_subscription_group {
            Some(group) => pattern.shared_filter(group),
            None => pattern.as_filter(),
        };

        let mut rx = self
            .client
            .subscribe(&filter, Qos::AtLeastOnce, !shared)
            .await
            .map_err(|source| RpcError::MqttError {
                source,
                context: ErrorContext::new(&self.command_name),
            })?;
        *self.request_filter.lock().await = Some(filter);

        self.cache.start().await;

        let client = Arc::clone(&self.client);
        let codec = self.codec.clone();
        let context = self.context.clone();
        let config = self.config.clone();
        let command_name = self.command_name.clone();
        let cache = Arc::clone(&self.cache);
        let dispatch = Arc::clone(&self.dispatch);
        let handler = Arc::clone(&self.handler);

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let client = Arc::clone(&client);
                let codec = codec.clone();
                let context = context.clone();
                let config = config.clone();
                let command_name = command_name.clone();
                let cache = Arc::clone(&cache);
                let handler = Arc::clone(&handler);

                dispatch
                    .submit(
                        client.client_id(),
                        config.concurrency,
                        Some(async move {
                            process_request::<Client, Req, Res, Cd, H>(
                                message, client, codec, context, config, command_name, cache, handler,
                            )
                            .await;
                        }),
                        || {},
                    )
                    .await;
            }
        });
        *self.receive_task.lock().await = Some(handle);
        Ok(())
    }

    /// Unsubscribes; in-flight handler tasks are left to drain on their own deadline.
    pub async fn stop(&self) {
        if let Some(handle) = self.receive_task.lock().await.take() {
            handle.abort();
        }
        if let Some(filter) = self.request_filter.lock().await.take() {
            if let Err(error) = self.client.unsubscribe(&filter).await {
                warn!(?error, "failed to unsubscribe executor request filter");
            }
        }
        self.cache.stop().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_request<Client, Req, Res, Cd, H>(
    message: IncomingMessage,
    client: Arc<Client>,
    codec: Cd,
    context: AppContext,
    config: ExecutorConfig,
    command_name: String,
    cache: Arc<ResponseCache>,
    handler: Arc<H>,
) where
    Client: PubSubClient,
    Req: Send + 'static,
    Res: Send + 'static,
    Cd: Codec<Req> + Codec<Res>,
    H: Handler<Req, Res>,
{
    let message_received = Instant::now();
    let IncomingMessage {
        topic: _,
        payload,
        properties,
        ack,
    } = message;

    let error_context = ErrorContext::new(&command_name);

    let Some(response_topic) = properties.response_topic.clone() else {
        debug!("request carries no response topic, dropping without a reply");
        ack();
        return;
    };

    let Some(correlation) = properties.correlation_data.clone().filter(|bytes| !bytes.is_empty()) else {
        publish_error_response(
            &client,
            &context,
            &response_topic,
            &[],
            RpcError::HeaderMissing {
                header_name: "correlationData".to_string(),
                context: error_context,
            },
        )
        .await;
        ack();
        return;
    };
    let error_context = error_context.with_correlation_bytes(&correlation);

    let Some(message_expiry) = properties.message_expiry else {
        publish_error_response(
            &client,
            &context,
            &response_topic,
            &correlation,
            RpcError::HeaderMissing {
                header_name: "messageExpiry".to_string(),
                context: error_context,
            },
        )
        .await;
        ack();
        return;
    };

    let (reserved, _application) = crate::envelope::split_headers(&properties.user_properties);
    let version_ok = reserved
        .get(HEADER_PROTOCOL_VERSION)
        .and_then(|value| ProtocolVersion::parse(value).ok())
        .map(|version| version.is_compatible_with(&[SUPPORTED_MAJOR_VERSION]))
        .unwrap_or(false);
    if !version_ok {
        let requested = reserved.get(HEADER_PROTOCOL_VERSION).cloned().unwrap_or_default();
        publish_error_response(
            &client,
            &context,
            &response_topic,
            &correlation,
            RpcError::UnsupportedRequestVersion {
                protocol_version: requested,
                supported_major_protocol_versions: vec![SUPPORTED_MAJOR_VERSION],
                context: error_context,
            },
        )
        .await;
        ack();
        return;
    }

    let command_timeout = message_expiry.min(config.execution_timeout);
    let command_expiration = message_received + command_timeout;

    let cache_key = CacheKey {
        response_topic: response_topic.clone(),
        correlation: correlation.clone(),
    };

    match cache.retrieve(cache_key.clone()).await {
        Ok(Some(mut receiver)) => {
            if receiver.borrow().is_none() {
                let _ = receiver.changed().await;
            }
            if let Some(cached) = receiver.borrow().clone() {
                publish_cached(&client, &cached).await;
            }
            ack();
            return;
        }
        Ok(None) => {}
        Err(crate::cache::CacheError::QueueCorruption) => {
            publish_error_response(
                &client,
                &context,
                &response_topic,
                &correlation,
                RpcError::InternalLogicError {
                    message: "response cache queue corruption detected".to_string(),
                    context: error_context,
                },
            )
            .await;
            ack();
            return;
        }
        Err(error) => {
            warn!(?error, "response cache unavailable, executing without dedup");
        }
    }

    let decoded_request = Codec::<Req>::decode(&codec, &payload, properties.content_type.as_deref());

    // A decode failure still flows through the common response/cache/publish tail below
    // (rather than returning early) because `cache.retrieve()` above already inserted a
    // pending placeholder for this correlation that must be fulfilled, not leaked.
    let execution_start = Instant::now();
    let (status, response_payload, property_name, property_value) = match decoded_request {
        Err(source) => {
            if matches!(source, crate::codec::CodecError::UnsupportedContentType(_)) {
                (StatusCode::UnsupportedMediaType, Vec::new(), None, None)
            } else {
                (StatusCode::BadRequest, Vec::new(), None, None)
            }
        }
        Ok(request) => {
            let deadline = command_expiration
                .saturating_duration_since(Instant::now())
                .min(config.execution_timeout);
            let cancellation = CancellationToken::new();
            let cancel_guard = cancellation.clone();
            let outcome = tokio::time::timeout(deadline, handler.handle(request, cancellation)).await;
            cancel_guard.cancel();
            match outcome {
                Err(_) => (
                    StatusCode::RequestTimeout,
                    Vec::new(),
                    Some("ExecutionTimeout".to_string()),
                    Some(format!("{command_timeout:?}")),
                ),
                Ok(HandlerOutcome::Response(response)) => match Codec::<Res>::encode(&codec, &response) {
                    Ok(bytes) => (StatusCode::Ok, bytes, None, None),
                    Err(error) => {
                        warn!(?error, "failed to encode handler response");
                        (StatusCode::InternalServerError, Vec::new(), None, None)
                    }
                },
                Ok(HandlerOutcome::InvocationError {
                    message: _,
                    property_name,
                    property_value,
                }) => (StatusCode::UnprocessableContent, Vec::new(), property_name, property_value),
                Ok(HandlerOutcome::ExecutionError(_)) => (StatusCode::InternalServerError, Vec::new(), None, None),
            }
        }
    };
    let execution_ms = execution_start.elapsed().as_millis() as u64;

    let status = if response_payload.is_empty() && status == StatusCode::Ok {
        StatusCode::NoContent
    } else {
        status
    };

    let now = context.now().await;
    let remaining_expiry = command_expiration.saturating_duration_since(Instant::now());

    if remaining_expiry.is_zero() {
        debug!("command expired before a response could be published, dropping");
        // Still fulfills the pending placeholder `cache.retrieve()` inserted above with an
        // already-expired entry, so the expiry worker reaps it instead of it leaking.
        let cached_message = CachedMessage {
            topic: response_topic.clone(),
            payload: Vec::new(),
            properties: PublishProperties {
                correlation_data: Some(correlation.clone()),
                response_topic: None,
                message_expiry: Some(Duration::ZERO),
                content_type: None,
                payload_format_indicator: None,
                user_properties: Vec::new(),
            },
        };
        let cost = CacheCostInputs {
            unit_overhead: 64,
            request_len: payload.len() as u64,
            response_len: 0,
            fixed_proc_ms: 0,
            execution_ms,
            idempotent: false,
            command_expiration: message_received,
        };
        if let Err(error) = cache.store(cache_key, cached_message, cost).await {
            warn!(?error, "failed to store expired placeholder in cache");
        }
        ack();
        return;
    }

    let mut user_properties = Vec::new();
    stamp_standard_headers(&mut user_properties, client.client_id(), &now);
    user_properties.push((HEADER_STATUS.to_string(), status.as_u16().to_string()));
    if status != StatusCode::Ok && status != StatusCode::NoContent {
        user_properties.push((HEADER_STATUS_MESSAGE.to_string(), format!("{status}")));
    }
    if matches!(status, StatusCode::InternalServerError | StatusCode::UnprocessableContent) {
        user_properties.push((HEADER_IS_APPLICATION_ERROR.to_string(), "true".to_string()));
    }
    if let Some(name) = &property_name {
        user_properties.push((HEADER_INVALID_PROPERTY_NAME.to_string(), name.clone()));
    }
    if let Some(value) = &property_value {
        user_properties.push((HEADER_INVALID_PROPERTY_VALUE.to_string(), value.clone()));
    }

    let response_properties = PublishProperties {
        correlation_data: Some(correlation.clone()),
        response_topic: None,
        message_expiry: Some(remaining_expiry),
        content_type: Some(Codec::<Res>::content_type(&codec).to_string()),
        payload_format_indicator: Some(Codec::<Res>::payload_format_indicator(&codec)),
        user_properties,
    };

    let cached_message = CachedMessage {
        topic: response_topic.clone(),
        payload: response_payload.clone(),
        properties: response_properties.clone(),
    };

    // Always store, even for non-idempotent commands: the placeholder this executor
    // inserted at `retrieve()` must be fulfilled and enqueued for expiry, or it leaks.
    // Idempotent commands additionally get `cache_ttl`-extended, evictable reuse.
    let cost = CacheCostInputs {
        unit_overhead: 64,
        request_len: payload.len() as u64,
        response_len: response_payload.len() as u64,
        fixed_proc_ms: 0,
        execution_ms,
        idempotent: config.idempotent,
        command_expiration: message_received + command_timeout.max(config.cache_ttl),
    };
    if let Err(error) = cache.store(cache_key, cached_message, cost).await {
        warn!(?error, "failed to store response in cache");
    }

    if let Err(error) = client
        .publish(&response_topic, &response_payload, Qos::AtLeastOnce, response_properties)
        .await
    {
        warn!(?error, %response_topic, "failed to publish response, request is still acknowledged");
    }

    ack();
}

async fn publish_cached<Client: PubSubClient>(client: &Client, cached: &CachedMessage) {
    if let Err(error) = client
        .publish(
            &cached.topic,
            &cached.payload,
            Qos::AtLeastOnce,
            cached.properties.clone(),
        )
        .await
    {
        warn!(?error, "failed to republish cached response");
    }
}

async fn publish_error_response<Client: PubSubClient>(
    client: &Client,
    context: &AppContext,
    response_topic: &str,
    correlation: &[u8],
    error: RpcError,
) {
    let status = crate::envelope::status_for_error(&error);
    let now = context.now().await;
    let mut user_properties = Vec::new();
    stamp_standard_headers(&mut user_properties, client.client_id(), &now);
    user_properties.push((HEADER_STATUS.to_string(), status.as_u16().to_string()));
    user_properties.push((HEADER_STATUS_MESSAGE.to_string(), error.to_string()));
    match &error {
        RpcError::HeaderMissing { header_name, .. } => {
            user_properties.push((HEADER_INVALID_PROPERTY_NAME.to_string(), header_name.clone()));
        }
        RpcError::HeaderInvalid {
            header_name,
            header_value,
            ..
        } => {
            user_properties.push((HEADER_INVALID_PROPERTY_NAME.to_string(), header_name.clone()));
            if let Some(value) = header_value {
                user_properties.push((HEADER_INVALID_PROPERTY_VALUE.to_string(), value.clone()));
            }
        }
        _ => {}
    }
    if status == StatusCode::NotSupportedVersion {
        if let RpcError::UnsupportedRequestVersion {
            protocol_version,
            supported_major_protocol_versions,
            ..
        } = &error
        {
            user_properties.push((HEADER_REQUESTED_PROTOCOL_VERSION.to_string(), protocol_version.clone()));
            user_properties.push((
                HEADER_SUPPORTED_MAJOR_PROTOCOL_VERSIONS.to_string(),
                supported_major_protocol_versions
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(" "),
            ));
        }
    }
    let properties = PublishProperties {
        correlation_data: Some(correlation.to_vec()),
        response_topic: None,
        message_expiry: Some(Duration::from_secs(60)),
        content_type: None,
        payload_format_indicator: None,
        user_properties,
    };
    if let Err(publish_error) = client.publish(response_topic, &[], Qos::AtLeastOnce, properties).await {
        warn!(?publish_error, %response_topic, "failed to publish synthesized error response");
    }
}

//! The pub/sub client contract the core requires. The core never talks to a concrete
//! broker library directly; every invoker/executor is generic over a [`PubSubClient`]
//! implementation instead of boxing a trait object, since exactly one implementation is
//! bound per instance.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish to `{topic}` failed: {message}")]
    Publish { topic: String, message: String },
    #[error("subscribe to `{filter}` failed: {message}")]
    Subscribe { filter: String, message: String },
    #[error("unsubscribe from `{filter}` failed: {message}")]
    Unsubscribe { filter: String, message: String },
    #[error("client disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtLeastOnce,
}

/// Per-publish metadata: correlation data, response topic, message expiry, content-type
/// framing, and user-properties (both reserved headers and application metadata, already
/// merged by the caller).
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    pub correlation_data: Option<Vec<u8>>,
    pub response_topic: Option<String>,
    pub message_expiry: Option<Duration>,
    pub content_type: Option<String>,
    pub payload_format_indicator: Option<u8>,
    pub user_properties: Vec<(String, String)>,
}

/// A deferred acknowledgment for a manually-acked inbound message. Owns a one-shot
/// completion so the core controls exactly when the underlying message is acked,
/// never implicitly.
pub type AckToken = Box<dyn FnOnce() + Send>;

/// A message delivered off a subscription, handed to the core through an owned channel
/// rather than a registered callback — there is no global mutable handler list to manage.
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
    pub ack: AckToken,
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .finish()
    }
}

/// The external pub/sub collaborator. Implementations wrap whatever broker library the
/// host uses; the core only ever calls these methods.
pub trait PubSubClient: Send + Sync + 'static {
    fn client_id(&self) -> &str;

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        properties: PublishProperties,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to `filter` and returns a receiver of every message that matches it.
    /// Calling this twice with the same filter is idempotent from the caller's
    /// perspective; implementations may multiplex internally. `no_local` requests the
    /// broker not to echo back this client's own publishes on a matching topic; it must
    /// not be set on a shared subscription (`$share/...`).
    fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
        no_local: bool,
    ) -> impl Future<Output = Result<mpsc::Receiver<IncomingMessage>, TransportError>> + Send;

    fn unsubscribe(&self, filter: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
}

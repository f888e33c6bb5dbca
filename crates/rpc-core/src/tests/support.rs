//! An in-memory fake pub/sub bus, in the shape of `mcp/test_support.rs`'s fake peer: a
//! minimal stand-in for a real broker, not a mock of `PubSubClient` itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::topic::filter_matches;
use crate::transport::{IncomingMessage, PublishProperties, PubSubClient, Qos, TransportError};

struct Subscription {
    filter: String,
    sender: mpsc::Sender<IncomingMessage>,
    owner_client_id: String,
    no_local: bool,
}

/// A shared message bus. Every [`FakeBroker`] handed out by [`FakeBus::client`] publishes
/// to, and can subscribe against, the same set of subscriptions.
#[derive(Clone)]
pub(super) struct FakeBus {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl FakeBus {
    pub(super) fn new() -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(super) fn client(&self, client_id: impl Into<String>) -> FakeBroker {
        FakeBroker {
            client_id: client_id.into(),
            bus: self.clone(),
        }
    }
}

pub(super) struct FakeBroker {
    client_id: String,
    bus: FakeBus,
}

impl PubSubClient for FakeBroker {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        _qos: Qos,
        properties: PublishProperties,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        let topic = topic.to_string();
        let payload = payload.to_vec();
        let publisher_client_id = self.client_id.clone();
        let bus = self.bus.clone();
        async move {
            let subscriptions = bus.subscriptions.lock().await;
            for subscription in subscriptions.iter() {
                if subscription.no_local && subscription.owner_client_id == publisher_client_id {
                    continue;
                }
                if filter_matches(&subscription.filter, &topic) {
                    let message = IncomingMessage {
                        topic: topic.clone(),
                        payload: payload.clone(),
                        properties: properties.clone(),
                        ack: Box::new(|| {}),
                    };
                    let _ = subscription.sender.send(message).await;
                }
            }
            Ok(())
        }
    }

    fn subscribe(
        &self,
        filter: &str,
        _qos: Qos,
        no_local: bool,
    ) -> impl std::future::Future<Output = Result<mpsc::Receiver<IncomingMessage>, TransportError>> + Send {
        let filter = filter.to_string();
        let owner_client_id = self.client_id.clone();
        let bus = self.bus.clone();
        async move {
            let (sender, receiver) = mpsc::channel(32);
            bus.subscriptions.lock().await.push(Subscription {
                filter,
                sender,
                owner_client_id,
                no_local,
            });
            Ok(receiver)
        }
    }

    fn unsubscribe(&self, filter: &str) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        let filter = filter.to_string();
        let bus = self.bus.clone();
        async move {
            bus.subscriptions.lock().await.retain(|subscription| subscription.filter != filter);
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(super) struct Ping {
    pub n: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(super) struct Pong {
    pub n: i32,
}

/// Builds the reserved user-properties a well-formed request carries, for tests that need
/// to hand-construct a request frame instead of going through an [`crate::invoker::Invoker`].
pub(super) fn request_properties(
    correlation: Vec<u8>,
    response_topic: &str,
    message_expiry: Duration,
    protocol_version: &str,
) -> PublishProperties {
    PublishProperties {
        correlation_data: Some(correlation),
        response_topic: Some(response_topic.to_string()),
        message_expiry: Some(message_expiry),
        content_type: Some("application/json".to_string()),
        payload_format_indicator: Some(1),
        user_properties: vec![
            (crate::envelope::HEADER_PROTOCOL_VERSION.to_string(), protocol_version.to_string()),
            (crate::envelope::HEADER_TIMESTAMP.to_string(), "00000000000000000000.0000000000.test".to_string()),
            (crate::envelope::HEADER_SOURCE_ID.to_string(), "test-caller".to_string()),
        ],
    }
}

pub(super) fn header(properties: &PublishProperties, name: &str) -> Option<String> {
    properties
        .user_properties
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

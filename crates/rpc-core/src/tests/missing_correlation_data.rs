use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::support::{header, request_properties, FakeBus, Ping, Pong};
use crate::codec::{Codec, JsonCodec};
use crate::config::ExecutorConfig;
use crate::context::AppContext;
use crate::envelope::{HEADER_INVALID_PROPERTY_NAME, HEADER_STATUS};
use crate::executor::Executor;
use crate::handler::HandlerOutcome;
use crate::transport::{PubSubClient, Qos};

#[tokio::test]
async fn a_request_without_correlation_data_gets_a_bad_request_response_instead_of_colliding_in_the_cache() {
    let bus = FakeBus::new();

    let executor = Executor::new(
        Arc::new(bus.client("executor-1")),
        JsonCodec,
        AppContext::new("executor-1", Duration::from_secs(5)),
        ExecutorConfig::new("rpc/uncorrelated"),
        "uncorrelated",
        |request: Ping, _cancellation: CancellationToken| async move { HandlerOutcome::Response(Pong { n: request.n }) },
    );
    executor.start().await.unwrap();

    let listener = bus.client("listener");
    let mut responses = listener
        .subscribe("test/uncorrelated-response", Qos::AtLeastOnce, false)
        .await
        .unwrap();

    let requester = bus.client("requester");
    let payload = Codec::<Ping>::encode(&JsonCodec, &Ping { n: 1 }).unwrap();
    let mut properties = request_properties(vec![], "test/uncorrelated-response", Duration::from_secs(5), "1.0");
    properties.correlation_data = None;
    requester
        .publish("rpc/uncorrelated", &payload, Qos::AtLeastOnce, properties)
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), responses.recv())
        .await
        .expect("response timed out")
        .expect("channel closed");

    assert_eq!(header(&response.properties, HEADER_STATUS), Some("400".to_string()));
    assert_eq!(
        header(&response.properties, HEADER_INVALID_PROPERTY_NAME),
        Some("correlationData".to_string())
    );

    executor.stop().await;
}

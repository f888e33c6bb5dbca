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
async fn a_slow_handler_yields_a_request_timeout_response() {
    let bus = FakeBus::new();

    let executor = Executor::new(
        Arc::new(bus.client("executor-1")),
        JsonCodec,
        AppContext::new("executor-1", Duration::from_secs(5)),
        ExecutorConfig::new("rpc/slow").with_execution_timeout(Duration::from_millis(50)),
        "slow",
        |_request: Ping, _cancellation: CancellationToken| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            HandlerOutcome::Response(Pong { n: 0 })
        },
    );
    executor.start().await.unwrap();

    let listener = bus.client("listener");
    let mut responses = listener.subscribe("test/timeout-response", Qos::AtLeastOnce, false).await.unwrap();

    let requester = bus.client("requester");
    let payload = Codec::<Ping>::encode(&JsonCodec, &Ping { n: 1 }).unwrap();
    let properties = request_properties(vec![2u8; 16], "test/timeout-response", Duration::from_secs(5), "1.0");
    requester.publish("rpc/slow", &payload, Qos::AtLeastOnce, properties).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), responses.recv())
        .await
        .expect("response timed out")
        .expect("channel closed");

    assert_eq!(header(&response.properties, HEADER_STATUS), Some("408".to_string()));
    assert_eq!(
        header(&response.properties, HEADER_INVALID_PROPERTY_NAME),
        Some("ExecutionTimeout".to_string())
    );

    executor.stop().await;
}

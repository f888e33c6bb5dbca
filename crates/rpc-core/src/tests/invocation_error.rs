use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::support::{header, request_properties, FakeBus, Ping, Pong};
use crate::codec::{Codec, JsonCodec};
use crate::config::ExecutorConfig;
use crate::context::AppContext;
use crate::envelope::{
    HEADER_INVALID_PROPERTY_NAME, HEADER_INVALID_PROPERTY_VALUE, HEADER_IS_APPLICATION_ERROR, HEADER_STATUS,
};
use crate::executor::Executor;
use crate::handler::HandlerOutcome;
use crate::transport::{PubSubClient, Qos};

#[tokio::test]
async fn a_rejected_argument_yields_unprocessable_content_with_the_offending_property() {
    let bus = FakeBus::new();

    let executor = Executor::new(
        Arc::new(bus.client("executor-1")),
        JsonCodec,
        AppContext::new("executor-1", Duration::from_secs(5)),
        ExecutorConfig::new("rpc/validated"),
        "validated",
        |request: Ping, _cancellation: CancellationToken| async move {
            if request.n < 0 {
                HandlerOutcome::InvocationError {
                    message: "n must not be negative".to_string(),
                    property_name: Some("n".to_string()),
                    property_value: Some(request.n.to_string()),
                }
            } else {
                HandlerOutcome::Response(Pong { n: request.n })
            }
        },
    );
    executor.start().await.unwrap();

    let listener = bus.client("listener");
    let mut responses = listener.subscribe("test/invocation-response", Qos::AtLeastOnce, false).await.unwrap();

    let requester = bus.client("requester");
    let payload = Codec::<Ping>::encode(&JsonCodec, &Ping { n: -5 }).unwrap();
    let properties = request_properties(vec![4u8; 16], "test/invocation-response", Duration::from_secs(5), "1.0");
    requester.publish("rpc/validated", &payload, Qos::AtLeastOnce, properties).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), responses.recv())
        .await
        .expect("response timed out")
        .expect("channel closed");

    assert_eq!(header(&response.properties, HEADER_STATUS), Some("422".to_string()));
    assert_eq!(header(&response.properties, HEADER_INVALID_PROPERTY_NAME), Some("n".to_string()));
    assert_eq!(header(&response.properties, HEADER_INVALID_PROPERTY_VALUE), Some("-5".to_string()));
    assert_eq!(header(&response.properties, HEADER_IS_APPLICATION_ERROR), Some("true".to_string()));

    executor.stop().await;
}

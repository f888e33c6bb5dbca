use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::support::{request_properties, FakeBus, Ping, Pong};
use crate::codec::JsonCodec;
use crate::config::InvokerConfig;
use crate::context::AppContext;
use crate::invoker::Invoker;
use crate::transport::{PubSubClient, Qos};

#[tokio::test]
async fn a_response_with_an_unrecognized_correlation_id_is_ignored() {
    let bus = FakeBus::new();

    let invoker: Invoker<_, Ping, Pong, _> = Invoker::new(
        Arc::new(bus.client("invoker-1")),
        JsonCodec,
        AppContext::new("invoker-1", Duration::from_secs(5)),
        InvokerConfig::new("rpc/echo"),
        "echo",
    );
    invoker.start().await.unwrap();

    // A stray response for a correlation id this invoker never issued. It must be dropped
    // silently rather than panicking or wedging the receive loop.
    let stray = bus.client("some-other-executor");
    let properties = request_properties(vec![9u8; 16], "unused", Duration::from_secs(5), "1.0");
    stray
        .publish("clients/invoker-1/rpc/echo", b"{}", Qos::AtLeastOnce, properties)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    // The receive loop must still be alive and able to service a real pending call.
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        invoker.invoke(
            "rpc/echo",
            Ping { n: 1 },
            HashMap::new(),
            HashMap::new(),
            Duration::from_secs(1),
        ),
    )
    .await
    .expect("invoke did not complete in time");

    // No executor is listening, so this legitimately times out — the point of the
    // assertion is that the call completed (the error is a `Timeout`, not a panic or a
    // hang caused by the earlier stray message).
    assert!(matches!(result, Err(crate::error::RpcError::Timeout { .. })));

    invoker.close().await;
}

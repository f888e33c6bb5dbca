use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::support::{FakeBus, Ping, Pong};
use crate::codec::JsonCodec;
use crate::config::{ExecutorConfig, InvokerConfig};
use crate::context::AppContext;
use crate::executor::Executor;
use crate::handler::HandlerOutcome;
use crate::invoker::Invoker;

#[tokio::test]
async fn full_round_trip_doubles_the_request() {
    let bus = FakeBus::new();

    let executor = Executor::new(
        Arc::new(bus.client("executor-1")),
        JsonCodec,
        AppContext::new("executor-1", Duration::from_secs(5)),
        ExecutorConfig::new("rpc/echo"),
        "echo",
        |request: Ping, _cancellation: CancellationToken| async move { HandlerOutcome::Response(Pong { n: request.n * 2 }) },
    );
    executor.start().await.unwrap();

    let invoker: Invoker<_, Ping, Pong, _> = Invoker::new(
        Arc::new(bus.client("invoker-1")),
        JsonCodec,
        AppContext::new("invoker-1", Duration::from_secs(5)),
        InvokerConfig::new("rpc/echo"),
        "echo",
    );
    invoker.start().await.unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        invoker.invoke(
            "rpc/echo",
            Ping { n: 21 },
            HashMap::new(),
            HashMap::new(),
            Duration::from_secs(2),
        ),
    )
    .await
    .expect("invoke did not complete in time")
    .expect("invoke returned an error");

    assert_eq!(response, Pong { n: 42 });

    invoker.close().await;
    executor.stop().await;
}

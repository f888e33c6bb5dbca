//! The user-supplied command implementation contract.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// What a handler may return: a normal response, a caller-fault rejection (maps to
/// `UnprocessableContent`), or a falling-through failure (maps to `InternalServerError`
/// with `is-application-error` set).
#[derive(Debug)]
pub enum HandlerOutcome<Res> {
    Response(Res),
    InvocationError {
        message: String,
        property_name: Option<String>,
        property_value: Option<String>,
    },
    ExecutionError(String),
}

/// One RPC command implementation. Generic over request/response types rather than a
/// trait object since an executor is built for exactly one command at a time.
pub trait Handler<Req, Res>: Send + Sync + 'static {
    fn handle(
        &self,
        request: Req,
        cancellation: CancellationToken,
    ) -> impl Future<Output = HandlerOutcome<Res>> + Send;
}

impl<Req, Res, F, Fut> Handler<Req, Res> for F
where
    F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome<Res>> + Send,
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn handle(&self, request: Req, cancellation: CancellationToken) -> impl Future<Output = HandlerOutcome<Res>> + Send {
        self(request, cancellation)
    }
}

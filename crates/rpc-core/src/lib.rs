#![forbid(unsafe_code)]
//! A correlated request/response RPC runtime layered on an at-least-once publish/subscribe
//! bus with MQTT 5 semantics: correlation data, per-message expiry, and user properties.
//!
//! The crate is split into the collaborators a command implementation is built from:
//!
//! - [`envelope`] — reserved header names, status-code/error-kind mapping, and protocol
//!   version negotiation. Pure, no I/O.
//! - [`topic`] — topic pattern token substitution and subscription filter matching.
//! - [`hlc`] / [`context`] — the hybrid logical clock and the shared service that owns it.
//! - [`transport`] — the [`transport::PubSubClient`] contract the core requires; bring
//!   your own broker binding.
//! - [`codec`] — the [`codec::Codec`] contract for payload (de)serialization, plus a
//!   `serde_json`-backed reference implementation.
//! - [`cache`] — the executor's duplicate-suppressing, cost-weighted response cache.
//! - [`dispatch`] — the bounded-concurrency worker pool backing executors.
//! - [`handler`] — the [`handler::Handler`] trait a command implementation satisfies.
//! - [`invoker`] / [`executor`] — the two RPC endpoints.
//! - [`config`] — builder-style configuration for both endpoints.
//! - [`error`] — the unified [`error::RpcError`] enum.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rpc_core::codec::JsonCodec;
//! use rpc_core::config::InvokerConfig;
//! use rpc_core::context::AppContext;
//! use rpc_core::invoker::Invoker;
//! # async fn run<C: rpc_core::transport::PubSubClient>(client: Arc<C>) -> Result<(), rpc_core::error::RpcError> {
//! let context = AppContext::new(client.client_id().to_string(), Duration::from_secs(1));
//! let config = InvokerConfig::new("rpc/{clientId}/getTemperature");
//! let invoker: Invoker<C, String, String, JsonCodec> =
//!     Invoker::new(client, JsonCodec, context, config, "getTemperature");
//! invoker.start().await?;
//! # Ok(()) }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod handler;
pub mod hlc;
pub mod invoker;
pub mod topic;
pub mod transport;

pub use error::RpcError;
pub use executor::Executor;
pub use handler::{Handler, HandlerOutcome};
pub use invoker::Invoker;

#[cfg(test)]
mod tests;

//! End-to-end scenario tests driven over an in-memory fake bus (see [`support`]) instead
//! of mocking `PubSubClient` itself.

mod support;

mod correlation_mismatch;
mod handler_timeout;
mod happy_path;
mod invocation_error;
mod missing_correlation_data;

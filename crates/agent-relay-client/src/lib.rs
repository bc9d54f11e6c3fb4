//! Client side of the agent relay: HTTP endpoints, the single-active
//! stream connection, and the submission pipeline.
//!
//! Provides:
//! - `SessionApi` / `HttpSessionApi` - create/terminate/replay/answer endpoints
//! - `StreamTransport` / `HttpStreamTransport` - the server-push byte stream
//! - `ConnectionManager` - one live connection, retry, rekey, graceful end
//! - `RelayClient` - submit prompts and drive the pieces together

pub mod api;
pub mod config;
pub mod connection;
pub mod submit;
pub mod transport;

mod effects;

#[cfg(test)]
mod testutil;

pub use api::{ApiError, HttpSessionApi, SessionApi, SubmitRequest, SubmitResponse};
pub use config::{ClientConfig, RetryConfig};
pub use connection::{ConnState, ConnectionManager};
pub use submit::{ClientError, RelayClient, SubmitOptions};
pub use transport::{ByteStream, ChannelTransport, HttpStreamTransport, StreamTransport, TransportError};

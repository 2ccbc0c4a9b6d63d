//! Federation engine — one namespace over many downstream servers.
//!
//! This module handles:
//! - Downstream connections over stdio child processes and streamable HTTP
//! - Session lifecycle (handshake, heartbeat, reconnect with backoff)
//! - Collision-free aggregation of tools, prompts, and resources
//! - REST endpoints translated into synthetic tools
//! - Invocation routing under deadlines, with bounded retry for read-only calls
//!
//! [`Gateway`] is the entry point used by upstream transports.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod translator;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use backoff::BackoffPolicy;
pub use config::{ApiWrapperConfig, BackendConfig, GatewayConfig};
pub use errors::{ErrorKind, ErrorObject, GatewayError};
pub use gateway::{Gateway, WrapperStatus};
pub use registry::Registry;
pub use session::{SessionEvent, SessionEventKind, SessionStatus};
pub use types::{
    CapabilityDescriptor, CapabilityKind, CatalogEntry, InvocationRequest, InvocationResult,
    ResourceContent, SessionState,
};

//! Endpoint Agent - host telemetry shipper
//!
//! Collects host metrics and collector-configured check results and ships
//! them, sealed and signed, over a persistent websocket to a remote
//! collector.

pub mod check;
pub mod config;
pub mod crypto;
pub mod docs;
pub mod errors;
pub mod input;
pub mod metrics;
pub mod nonce;
pub mod registration;
pub mod stream;

pub use errors::AgentError;

//! waypost-core — shared types for waypost service discovery.
//!
//! Holds the leaf pieces every other crate builds on: endpoint
//! definitions and health statuses, service id generation, the
//! discovery configuration, the error taxonomy, and the clocks used
//! for TTL bookkeeping.

pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::DiscoveryConfig;
pub use endpoint::{EndpointDefinition, HealthStatus, unique_string, unique_string_with};
pub use error::{DiscoveryError, DiscoveryResult};

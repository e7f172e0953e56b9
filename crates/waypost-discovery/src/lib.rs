//! waypost-discovery — service registration, check-ins, and lookup.
//!
//! Services register endpoints under a logical name and keep them alive
//! with check-ins; clients resolve a name to the current endpoints.
//!
//! # Architecture
//!
//! ```text
//! ServiceDiscovery (trait)
//!   ├── LocalDiscovery — this process only
//!   │   └── LocalRegistry (id → entry, TTL, sweep)
//!   └── BackedDiscovery
//!       ├── LocalRegistry
//!       ├── RemoteCache (name → endpoints, refresh, watch, change events)
//!       └── DiscoveryBackend (fetch / push / remove / subscribe)
//!
//! Background (while started)
//!   ├── expiry sweep tick → LocalRegistry::sweep_expired
//!   └── watch poll tick   → RemoteCache::refresh_watched
//! ```
//!
//! # Consistency
//!
//! Lookups always include this process's own live registrations, even
//! before the backend has seen them. Backend failures on the mirror path
//! (register, check-in, unregister) are logged and swallowed; only the
//! forced lookups (`load_services_now`, `load_services_async`) report them.

pub mod backend;
pub mod cache;
pub mod callback;
pub mod discovery;
pub mod registry;
pub mod sweeper;

pub use backend::{ChangeCallback, DiscoveryBackend, MemoryBackend};
pub use cache::{CacheEntry, RemoteCache, ServiceChange};
pub use callback::Callback;
pub use discovery::{
    BackedDiscovery, LoadCallback, LocalDiscovery, ServiceDiscovery, build_discovery,
    build_discovery_with_clock,
};
pub use registry::{LocalRegistry, RegistryEntry};
pub use sweeper::Ticker;

pub use waypost_core::{
    DiscoveryConfig, DiscoveryError, DiscoveryResult, EndpointDefinition, HealthStatus,
};

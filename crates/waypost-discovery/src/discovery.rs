//! The discovery facade — what services and clients talk to.
//!
//! `ServiceDiscovery` has two implementations:
//! - `LocalDiscovery` keeps only this process's registrations.
//! - `BackedDiscovery` adds a remote cache and mirrors to a backend.
//!
//! `build_discovery` picks one from configuration.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use waypost_core::{
    DiscoveryConfig, DiscoveryError, DiscoveryResult, EndpointDefinition, HealthStatus,
    SharedClock, SystemClock,
};

use crate::backend::DiscoveryBackend;
use crate::cache::{RemoteCache, ServiceChange};
use crate::callback::Callback;
use crate::registry::LocalRegistry;
use crate::sweeper::{Ticker, mirror_with_timeout, spawn_poller, spawn_sweeper};

/// Names `BackedDiscovery` remembers having primed before it starts over.
const PRIMED_LIMIT: usize = 1024;

/// Completion handler for `load_services_async`.
pub type LoadCallback = Box<dyn FnOnce(DiscoveryResult<Vec<EndpointDefinition>>) + Send>;

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    fn config(&self) -> &DiscoveryConfig;

    /// Name of the backend in use, `None` for local-only discovery.
    fn backend_name(&self) -> Option<&str>;

    /// Store a caller-built definition and mirror it to the backend.
    ///
    /// Invalid definitions fail here without touching any state.
    async fn register_definition(
        &self,
        definition: EndpointDefinition,
    ) -> DiscoveryResult<EndpointDefinition>;

    async fn register(&self, service_name: &str, port: u16) -> DiscoveryResult<EndpointDefinition> {
        self.register_definition(EndpointDefinition::from_name_and_port(service_name, port))
            .await
    }

    async fn register_with_ttl(
        &self,
        service_name: &str,
        port: u16,
        time_to_live_seconds: i64,
    ) -> DiscoveryResult<EndpointDefinition> {
        self.register_definition(EndpointDefinition::from_name_and_port_with_ttl(
            service_name,
            port,
            time_to_live_seconds,
        ))
        .await
    }

    /// Register with the configured default TTL.
    async fn register_with_default_ttl(
        &self,
        service_name: &str,
        port: u16,
    ) -> DiscoveryResult<EndpointDefinition> {
        let ttl = self.config().ttl_default_seconds;
        self.register_with_ttl(service_name, port, ttl).await
    }

    async fn register_with_id_and_time_to_live(
        &self,
        service_name: &str,
        service_id: &str,
        port: u16,
        time_to_live_seconds: i64,
    ) -> DiscoveryResult<EndpointDefinition> {
        self.register_definition(EndpointDefinition::from_name_id_port_ttl(
            service_name,
            service_id,
            port,
            time_to_live_seconds,
        ))
        .await
    }

    async fn register_with_id(
        &self,
        service_name: &str,
        service_id: &str,
        port: u16,
    ) -> DiscoveryResult<EndpointDefinition> {
        self.register_definition(EndpointDefinition::from_name_id_port(
            service_name,
            service_id,
            port,
        ))
        .await
    }

    /// Remove a registration. Returns true if it was registered locally.
    async fn unregister(&self, service_id: &str) -> bool;

    /// Record a check-in. Unknown ids are ignored.
    async fn check_in(&self, service_id: &str, status: HealthStatus);

    async fn check_in_ok(&self, service_id: &str) {
        self.check_in(service_id, HealthStatus::Pass).await
    }

    /// Keep `service_name` current in the remote cache.
    async fn watch(&self, service_name: &str);

    /// Cached endpoints merged with this process's own registrations.
    ///
    /// Never blocks on the backend and never fails; an unknown name
    /// yields an empty list.
    fn load_services(&self, service_name: &str) -> Vec<EndpointDefinition>;

    /// Like `load_services_now` without blocking the caller.
    ///
    /// `callback` fires exactly once, with the endpoints, the backend
    /// error, or `BackendTimeout` after the configured lookup timeout.
    fn load_services_async(&self, service_name: &str, callback: LoadCallback);

    /// Force a backend pull, then merge with local registrations.
    async fn load_services_now(&self, service_name: &str)
    -> DiscoveryResult<Vec<EndpointDefinition>>;

    /// Only the endpoints registered by this process.
    fn local_definitions(&self) -> Vec<EndpointDefinition>;

    /// `load_services` restricted to endpoints reporting pass or warn.
    fn healthy_services(&self, service_name: &str) -> Vec<EndpointDefinition> {
        self.load_services(service_name)
            .into_iter()
            .filter(|def| def.health_status.is_healthy())
            .collect()
    }

    /// Start background ticks and connect the backend. Idempotent.
    async fn start(&self);

    /// Stop background ticks and release the backend. Idempotent.
    async fn stop(&self);
}

/// Tickers owned while started.
#[derive(Default)]
struct Lifecycle {
    tickers: Vec<Ticker>,
    started: bool,
}

impl Lifecycle {
    async fn shutdown(&mut self) -> bool {
        if !self.started {
            return false;
        }
        for ticker in self.tickers.drain(..) {
            ticker.stop().await;
        }
        self.started = false;
        true
    }
}

/// Merge cached endpoints for `service_name` with this process's own.
///
/// The registry decides for every id it holds: a cached copy of such an
/// id is dropped, so an entry that expired locally stays hidden even
/// before the sweep has run. Results are ordered by id.
fn merge(
    registry: &LocalRegistry,
    service_name: &str,
    remote: Vec<EndpointDefinition>,
) -> Vec<EndpointDefinition> {
    let mut by_id: BTreeMap<String, EndpointDefinition> = remote
        .into_iter()
        .filter(|def| !registry.contains(&def.id))
        .map(|def| (def.id.clone(), def))
        .collect();
    for def in registry.snapshot_for(service_name) {
        by_id.insert(def.id.clone(), def);
    }
    by_id.into_values().collect()
}

// ── Local only ─────────────────────────────────────────────────────

/// Discovery without a backend: lookups see only local registrations.
pub struct LocalDiscovery {
    config: DiscoveryConfig,
    registry: LocalRegistry,
    lifecycle: Mutex<Lifecycle>,
}

impl LocalDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: DiscoveryConfig, clock: SharedClock) -> Self {
        Self {
            config,
            registry: LocalRegistry::new(clock),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }

    fn no_backend(&self) -> DiscoveryError {
        DiscoveryError::BackendUnavailable("no discovery backend configured".to_string())
    }
}

#[async_trait]
impl ServiceDiscovery for LocalDiscovery {
    fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn backend_name(&self) -> Option<&str> {
        None
    }

    async fn register_definition(
        &self,
        definition: EndpointDefinition,
    ) -> DiscoveryResult<EndpointDefinition> {
        self.registry.register(definition)
    }

    async fn unregister(&self, service_id: &str) -> bool {
        self.registry.unregister(service_id)
    }

    async fn check_in(&self, service_id: &str, status: HealthStatus) {
        self.registry.check_in(service_id, status);
    }

    async fn watch(&self, service_name: &str) {
        debug!(service = %service_name, "watch ignored without backend");
    }

    fn load_services(&self, service_name: &str) -> Vec<EndpointDefinition> {
        self.registry.snapshot_for(service_name)
    }

    fn load_services_async(&self, service_name: &str, callback: LoadCallback) {
        let result = if self.config.strict_forced_reads {
            Err(self.no_backend())
        } else {
            Ok(self.registry.snapshot_for(service_name))
        };
        callback(result);
    }

    async fn load_services_now(
        &self,
        service_name: &str,
    ) -> DiscoveryResult<Vec<EndpointDefinition>> {
        if self.config.strict_forced_reads {
            return Err(self.no_backend());
        }
        Ok(self.registry.snapshot_for(service_name))
    }

    fn local_definitions(&self) -> Vec<EndpointDefinition> {
        self.registry.snapshot()
    }

    async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return;
        }
        lifecycle.tickers.push(spawn_sweeper(
            self.registry.clone(),
            None,
            self.config.sweep_interval(),
            self.config.async_lookup_timeout(),
        ));
        lifecycle.started = true;
        info!("local discovery started");
    }

    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.shutdown().await {
            info!("local discovery stopped");
        }
    }
}

// ── Backed ─────────────────────────────────────────────────────────

/// Discovery composed of the local registry, a remote cache, and a backend.
pub struct BackedDiscovery {
    config: DiscoveryConfig,
    registry: LocalRegistry,
    cache: RemoteCache,
    backend: Arc<dyn DiscoveryBackend>,
    /// Names already pulled once on behalf of `load_services`.
    primed: std::sync::Mutex<HashSet<String>>,
    lifecycle: Mutex<Lifecycle>,
}

impl BackedDiscovery {
    pub fn new(config: DiscoveryConfig, backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DiscoveryConfig,
        backend: Arc<dyn DiscoveryBackend>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            registry: LocalRegistry::new(clock.clone()),
            cache: RemoteCache::new(clock),
            backend,
            primed: std::sync::Mutex::new(HashSet::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &RemoteCache {
        &self.cache
    }

    pub fn subscribe_changes(&self) -> tokio::sync::broadcast::Receiver<ServiceChange> {
        self.cache.subscribe_changes()
    }

    /// Run a mirror call bounded by the lookup timeout, logging failures.
    async fn mirror<F>(&self, op: &str, service_id: &str, call: F)
    where
        F: Future<Output = DiscoveryResult<()>> + Send,
    {
        mirror_with_timeout(op, service_id, self.config.async_lookup_timeout(), call).await;
    }

    /// Pull a never-loaded service once in the background so later
    /// `load_services` calls see it. Needs a running tokio runtime.
    fn prime(&self, service_name: &str) {
        if self.cache.last_refreshed_at(service_name).is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        {
            let mut primed = self.primed.lock().expect("primed lock");
            if primed.contains(service_name) {
                return;
            }
            if primed.len() >= PRIMED_LIMIT {
                primed.clear();
            }
            primed.insert(service_name.to_string());
        }
        let cache = self.cache.clone();
        let backend = self.backend.clone();
        let name = service_name.to_string();
        runtime.spawn(async move {
            // Failures are logged by refresh.
            let _ = cache.refresh(&name, backend.as_ref()).await;
        });
    }
}

#[async_trait]
impl ServiceDiscovery for BackedDiscovery {
    fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn backend_name(&self) -> Option<&str> {
        Some(self.backend.name())
    }

    async fn register_definition(
        &self,
        definition: EndpointDefinition,
    ) -> DiscoveryResult<EndpointDefinition> {
        let stored = self.registry.register(definition)?;
        self.mirror("register", &stored.id, self.backend.push(&stored))
            .await;
        Ok(stored)
    }

    async fn unregister(&self, service_id: &str) -> bool {
        let existed = self.registry.unregister(service_id);
        self.cache.forget(service_id);
        self.mirror("unregister", service_id, self.backend.remove(service_id))
            .await;
        existed
    }

    async fn check_in(&self, service_id: &str, status: HealthStatus) {
        if let Some(updated) = self.registry.check_in(service_id, status) {
            self.mirror("check-in", service_id, self.backend.push(&updated))
                .await;
        }
    }

    async fn watch(&self, service_name: &str) {
        self.cache
            .watch(service_name, Some(self.backend.as_ref()))
            .await;
    }

    fn load_services(&self, service_name: &str) -> Vec<EndpointDefinition> {
        self.prime(service_name);
        merge(&self.registry, service_name, self.cache.get(service_name))
    }

    fn load_services_async(&self, service_name: &str, callback: LoadCallback) {
        let registry = self.registry.clone();
        let name = service_name.to_string();
        self.cache.refresh_async(
            service_name,
            self.backend.clone(),
            self.config.async_lookup_timeout(),
            Callback::new(move |result| {
                callback(result.map(|remote| merge(&registry, &name, remote)));
            }),
        );
    }

    async fn load_services_now(
        &self,
        service_name: &str,
    ) -> DiscoveryResult<Vec<EndpointDefinition>> {
        let remote = self.cache.refresh(service_name, self.backend.as_ref()).await?;
        Ok(merge(&self.registry, service_name, remote))
    }

    fn local_definitions(&self) -> Vec<EndpointDefinition> {
        self.registry.snapshot()
    }

    async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return;
        }

        let timeout = self.config.async_lookup_timeout();
        match tokio::time::timeout(timeout, self.backend.connect()).await {
            Ok(Ok(())) => {}
            // Local bookkeeping keeps working; lookups report the failure.
            Ok(Err(e)) => {
                warn!(backend = self.backend.name(), error = %e, "backend connect failed")
            }
            Err(_) => {
                warn!(
                    backend = self.backend.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "backend connect timed out"
                )
            }
        }

        lifecycle.tickers.push(spawn_sweeper(
            self.registry.clone(),
            Some((self.cache.clone(), self.backend.clone())),
            self.config.sweep_interval(),
            timeout,
        ));
        if let Some(period) = self.config.poll_interval() {
            lifecycle.tickers.push(spawn_poller(
                self.cache.clone(),
                self.backend.clone(),
                period,
                timeout,
            ));
        }
        lifecycle.started = true;
        info!(backend = self.backend.name(), "backed discovery started");
    }

    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.shutdown().await {
            self.primed.lock().expect("primed lock").clear();
            let timeout = self.config.async_lookup_timeout();
            if tokio::time::timeout(timeout, self.backend.disconnect()).await.is_err() {
                warn!(backend = self.backend.name(), "backend disconnect timed out");
            }
            info!(backend = self.backend.name(), "backed discovery stopped");
        }
    }
}

/// Build the discovery variant the configuration asks for.
///
/// A backend is only used when `backend_enabled` is set; without one the
/// result degrades to local-only discovery.
pub fn build_discovery(
    config: DiscoveryConfig,
    backend: Option<Arc<dyn DiscoveryBackend>>,
) -> DiscoveryResult<Arc<dyn ServiceDiscovery>> {
    build_discovery_with_clock(config, backend, Arc::new(SystemClock))
}

pub fn build_discovery_with_clock(
    config: DiscoveryConfig,
    backend: Option<Arc<dyn DiscoveryBackend>>,
    clock: SharedClock,
) -> DiscoveryResult<Arc<dyn ServiceDiscovery>> {
    config.validate()?;
    match (config.backend_enabled, backend) {
        (true, Some(backend)) => {
            info!(backend = backend.name(), "using backed discovery");
            Ok(Arc::new(BackedDiscovery::with_clock(config, backend, clock)))
        }
        (true, None) => {
            warn!("backend enabled but none supplied, using local discovery");
            Ok(Arc::new(LocalDiscovery::with_clock(config, clock)))
        }
        (false, _) => {
            info!("backend disabled, using local discovery");
            Ok(Arc::new(LocalDiscovery::with_clock(config, clock)))
        }
    }
}

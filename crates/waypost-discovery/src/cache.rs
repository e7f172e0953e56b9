//! Remote cache — the locally held view of what the backend knows.
//!
//! Keyed by service name. Entries are replaced wholesale by backend pulls
//! (`refresh`) or push events (`apply`), and a `ServiceChange` is
//! broadcast whenever the endpoint set of a name actually changes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use waypost_core::{DiscoveryError, DiscoveryResult, EndpointDefinition, SharedClock};

use crate::backend::{ChangeCallback, DiscoveryBackend};
use crate::callback::Callback;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Cached endpoints for one service name.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub endpoints: Vec<EndpointDefinition>,
    pub last_refreshed_at_millis: u64,
}

/// Broadcast when the cached endpoint set of a service changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceChange {
    pub service_name: String,
    pub endpoints: Vec<EndpointDefinition>,
}

#[derive(Clone)]
pub struct RemoteCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    watched: Arc<RwLock<HashSet<String>>>,
    changes: broadcast::Sender<ServiceChange>,
    clock: SharedClock,
}

impl RemoteCache {
    pub fn new(clock: SharedClock) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            watched: Arc::new(RwLock::new(HashSet::new())),
            changes,
            clock,
        }
    }

    /// Last known endpoints for `service_name`; empty if never populated.
    pub fn get(&self, service_name: &str) -> Vec<EndpointDefinition> {
        let entries = self.entries.read().expect("cache lock");
        entries
            .get(service_name)
            .map(|entry| entry.endpoints.clone())
            .unwrap_or_default()
    }

    pub fn last_refreshed_at(&self, service_name: &str) -> Option<u64> {
        let entries = self.entries.read().expect("cache lock");
        entries
            .get(service_name)
            .map(|entry| entry.last_refreshed_at_millis)
    }

    /// Replace the cached endpoints of `service_name`.
    ///
    /// Returns true when the endpoint set differs from what was cached.
    pub fn apply(&self, service_name: &str, mut endpoints: Vec<EndpointDefinition>) -> bool {
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints.dedup_by(|a, b| a.id == b.id);

        let now = self.clock.now_millis();
        let changed = {
            let mut entries = self.entries.write().expect("cache lock");
            let changed = entries
                .get(service_name)
                .is_none_or(|entry| entry.endpoints != endpoints);
            entries.insert(
                service_name.to_string(),
                CacheEntry {
                    endpoints: endpoints.clone(),
                    last_refreshed_at_millis: now,
                },
            );
            changed
        };

        if changed {
            debug!(service = %service_name, endpoints = endpoints.len(), "cached endpoints changed");
            // No receivers is fine.
            let _ = self.changes.send(ServiceChange {
                service_name: service_name.to_string(),
                endpoints,
            });
        }
        changed
    }

    /// Drop `service_id` from every cached service. Returns true if found.
    pub fn forget(&self, service_id: &str) -> bool {
        let mut changed = Vec::new();
        {
            let mut entries = self.entries.write().expect("cache lock");
            for (name, entry) in entries.iter_mut() {
                let before = entry.endpoints.len();
                entry.endpoints.retain(|def| def.id != service_id);
                if entry.endpoints.len() != before {
                    changed.push(ServiceChange {
                        service_name: name.clone(),
                        endpoints: entry.endpoints.clone(),
                    });
                }
            }
        }
        let found = !changed.is_empty();
        for change in changed {
            let _ = self.changes.send(change);
        }
        found
    }

    /// Pull `service_name` from the backend and replace the cached set.
    ///
    /// Backend failures are returned and leave the cache untouched.
    pub async fn refresh(
        &self,
        service_name: &str,
        backend: &dyn DiscoveryBackend,
    ) -> DiscoveryResult<Vec<EndpointDefinition>> {
        match backend.fetch(service_name).await {
            Ok(endpoints) => {
                self.apply(service_name, endpoints);
                Ok(self.get(service_name))
            }
            Err(e) => {
                warn!(service = %service_name, backend = backend.name(), error = %e, "backend refresh failed");
                Err(e)
            }
        }
    }

    /// Refresh in the background and report through `callback`.
    ///
    /// The callback fires exactly once: with the fetched endpoints, the
    /// backend error, or `BackendTimeout` once `timeout` passes. A fetch
    /// that outlives the timeout keeps running and still updates the cache.
    /// Called outside a tokio runtime, it fires at once with
    /// `BackendUnavailable`.
    pub fn refresh_async(
        &self,
        service_name: &str,
        backend: Arc<dyn DiscoveryBackend>,
        timeout: Duration,
        callback: Callback<Vec<EndpointDefinition>>,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(service = %service_name, "async lookup requested outside a tokio runtime");
            callback.complete(Err(DiscoveryError::BackendUnavailable(
                "no tokio runtime to run the lookup on".to_string(),
            )));
            return;
        };

        let cache = self.clone();
        let name = service_name.to_string();
        let fetch_callback = callback.clone();
        let fetch = runtime.spawn(async move {
            let result = cache.refresh(&name, backend.as_ref()).await;
            if !fetch_callback.complete(result) {
                debug!(service = %name, "late backend response applied to cache only");
            }
        });

        let name = service_name.to_string();
        runtime.spawn(async move {
            match tokio::time::timeout(timeout, fetch).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    callback.complete(Err(DiscoveryError::Backend(format!(
                        "refresh of '{name}' aborted: {join_err}"
                    ))));
                }
                Err(_) => {
                    let timeout_ms = timeout.as_millis() as u64;
                    if callback.complete(Err(DiscoveryError::BackendTimeout {
                        service: name.clone(),
                        timeout_ms,
                    })) {
                        warn!(service = %name, timeout_ms, "async lookup timed out");
                    }
                }
            }
        });
    }

    /// Register interest in `service_name`.
    ///
    /// Push-capable backends get a subscription that feeds this cache.
    /// Backends without push support are polled instead. A failed
    /// subscription leaves the name unwatched so a later call retries it.
    pub async fn watch(&self, service_name: &str, backend: Option<&dyn DiscoveryBackend>) {
        let newly_watched = self
            .watched
            .write()
            .expect("cache lock")
            .insert(service_name.to_string());
        if !newly_watched {
            return;
        }

        let Some(backend) = backend else {
            debug!(service = %service_name, "watch recorded without backend");
            return;
        };

        let cache = self.clone();
        let on_change: ChangeCallback = Arc::new(move |name: String, endpoints: Vec<EndpointDefinition>| {
            cache.apply(&name, endpoints);
        });
        match backend.subscribe(service_name, on_change).await {
            Ok(true) => info!(service = %service_name, backend = backend.name(), "watching service"),
            Ok(false) => {
                debug!(service = %service_name, backend = backend.name(), "backend has no push support")
            }
            Err(e) => {
                warn!(service = %service_name, backend = backend.name(), error = %e, "subscribe failed");
                self.watched.write().expect("cache lock").remove(service_name);
            }
        }
    }

    pub fn is_watched(&self, service_name: &str) -> bool {
        self.watched.read().expect("cache lock").contains(service_name)
    }

    /// Watched service names, sorted.
    pub fn watched(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .watched
            .read()
            .expect("cache lock")
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Refresh every watched service, logging failures. Each pull is
    /// abandoned after `timeout`.
    ///
    /// Returns the number of services refreshed successfully.
    pub async fn refresh_watched(&self, backend: &dyn DiscoveryBackend, timeout: Duration) -> usize {
        let mut refreshed = 0;
        for name in self.watched() {
            match tokio::time::timeout(timeout, self.refresh(&name, backend)).await {
                Ok(Ok(_)) => refreshed += 1,
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(service = %name, timeout_ms = timeout.as_millis() as u64, "watched refresh timed out")
                }
            }
        }
        refreshed
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ServiceChange> {
        self.changes.subscribe()
    }
}

//! Discovery backend contract and an in-process implementation.
//!
//! A backend is the external system of record: registrations and
//! check-ins are mirrored to it, and lookups pull from it. Transport and
//! payload encoding live entirely behind this trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use waypost_core::{DiscoveryResult, EndpointDefinition};

/// Invoked by push-capable backends when the endpoint set of a watched
/// service changes. Receives the service name and its full endpoint list.
pub type ChangeCallback = Arc<dyn Fn(String, Vec<EndpointDefinition>) + Send + Sync>;

#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &str;

    /// Pull the current endpoints for `service_name`.
    async fn fetch(&self, service_name: &str) -> DiscoveryResult<Vec<EndpointDefinition>>;

    /// Mirror a local registration or check-in.
    async fn push(&self, definition: &EndpointDefinition) -> DiscoveryResult<()>;

    /// Mirror a local unregistration or expiry.
    async fn remove(&self, _service_id: &str) -> DiscoveryResult<()> {
        Ok(())
    }

    /// Ask for proactive updates for `service_name`.
    ///
    /// Returns `Ok(false)` when the backend cannot push; callers fall back
    /// to polling.
    async fn subscribe(
        &self,
        _service_name: &str,
        _on_change: ChangeCallback,
    ) -> DiscoveryResult<bool> {
        Ok(false)
    }

    /// Open whatever connection the backend needs.
    async fn connect(&self) -> DiscoveryResult<()> {
        Ok(())
    }

    /// Release the connection opened by `connect`.
    async fn disconnect(&self) {}
}

/// In-process backend shared by every discovery instance holding it.
///
/// Useful for single-host deployments and for exercising the backed
/// discovery path without a network. Subscribers are notified
/// synchronously after every push or remove.
#[derive(Default)]
pub struct MemoryBackend {
    /// service name → service id → definition.
    services: RwLock<HashMap<String, HashMap<String, EndpointDefinition>>>,
    subscribers: RwLock<HashMap<String, Vec<ChangeCallback>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All endpoints of a service, sorted by id.
    pub fn endpoints(&self, service_name: &str) -> Vec<EndpointDefinition> {
        let services = self.services.read().expect("backend lock");
        let mut defs: Vec<EndpointDefinition> = services
            .get(service_name)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    pub fn subscriber_count(&self, service_name: &str) -> usize {
        let subscribers = self.subscribers.read().expect("backend lock");
        subscribers.get(service_name).map_or(0, Vec::len)
    }

    fn notify(&self, service_name: &str) {
        let callbacks: Vec<ChangeCallback> = {
            let subscribers = self.subscribers.read().expect("backend lock");
            subscribers.get(service_name).cloned().unwrap_or_default()
        };
        if callbacks.is_empty() {
            return;
        }
        let endpoints = self.endpoints(service_name);
        for callback in callbacks {
            callback(service_name.to_string(), endpoints.clone());
        }
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, service_name: &str) -> DiscoveryResult<Vec<EndpointDefinition>> {
        Ok(self.endpoints(service_name))
    }

    async fn push(&self, definition: &EndpointDefinition) -> DiscoveryResult<()> {
        let moved_from: Vec<String> = {
            let mut services = self.services.write().expect("backend lock");
            // An id re-registered under another service name leaves the old one.
            let moved_from = services
                .iter_mut()
                .filter(|(name, _)| **name != definition.service_name)
                .filter_map(|(name, by_id)| by_id.remove(&definition.id).map(|_| name.clone()))
                .collect();
            services
                .entry(definition.service_name.clone())
                .or_default()
                .insert(definition.id.clone(), definition.clone());
            moved_from
        };
        debug!(service_id = %definition.id, service = %definition.service_name, "memory backend updated");
        for name in moved_from {
            self.notify(&name);
        }
        self.notify(&definition.service_name);
        Ok(())
    }

    async fn remove(&self, service_id: &str) -> DiscoveryResult<()> {
        let affected: Vec<String> = {
            let mut services = self.services.write().expect("backend lock");
            services
                .iter_mut()
                .filter_map(|(name, by_id)| by_id.remove(service_id).map(|_| name.clone()))
                .collect()
        };
        for name in affected {
            debug!(%service_id, service = %name, "memory backend entry removed");
            self.notify(&name);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        service_name: &str,
        on_change: ChangeCallback,
    ) -> DiscoveryResult<bool> {
        let mut subscribers = self.subscribers.write().expect("backend lock");
        subscribers
            .entry(service_name.to_string())
            .or_default()
            .push(on_change);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn push_and_fetch() {
        let backend = MemoryBackend::new();
        backend
            .push(&EndpointDefinition::from_name_id_port("orders", "orders-2", 8081))
            .await
            .unwrap();
        backend
            .push(&EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .await
            .unwrap();

        let defs = backend.fetch("orders").await.unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].id, "orders-1");
        assert!(backend.fetch("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_replaces_by_id() {
        let backend = MemoryBackend::new();
        backend
            .push(&EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .await
            .unwrap();
        backend
            .push(&EndpointDefinition::from_name_id_port("orders", "orders-1", 9090))
            .await
            .unwrap();

        let defs = backend.endpoints("orders");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].port, 9090);
    }

    #[tokio::test]
    async fn remove_unknown_is_ok() {
        let backend = MemoryBackend::new();
        assert!(backend.remove("nope").await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_see_pushes_and_removes() {
        let backend = MemoryBackend::new();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ChangeCallback = Arc::new(move |name: String, endpoints: Vec<EndpointDefinition>| {
            assert_eq!(name, "orders");
            sink.lock().unwrap().push(endpoints.len());
        });

        assert!(backend.subscribe("orders", callback).await.unwrap());
        assert_eq!(backend.subscriber_count("orders"), 1);

        backend
            .push(&EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .await
            .unwrap();
        backend
            .push(&EndpointDefinition::from_name_id_port("billing", "billing-1", 7070))
            .await
            .unwrap();
        backend.remove("orders-1").await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }
}

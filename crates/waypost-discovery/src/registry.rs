//! Local registry — endpoints registered by this process.
//!
//! Entries are keyed by service id. Each entry remembers when it last
//! checked in; entries with a TTL are removed by `sweep_expired` once
//! they have been silent for longer than their TTL.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use waypost_core::{DiscoveryResult, EndpointDefinition, HealthStatus, SharedClock};

/// A locally registered endpoint plus its check-in bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub definition: EndpointDefinition,
    /// Unix millis of registration or the latest check-in.
    pub last_check_in_at_millis: u64,
}

impl RegistryEntry {
    /// `None` for entries without a TTL, or whose expiry lies beyond
    /// what a `u64` of millis can hold.
    pub fn expires_at_millis(&self) -> Option<u64> {
        let ttl_millis = u64::try_from(self.definition.ttl()?.as_millis()).ok()?;
        self.last_check_in_at_millis.checked_add(ttl_millis)
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at_millis()
            .is_some_and(|expires_at| now_millis > expires_at)
    }
}

/// Thread-safe store of this process's registrations.
///
/// Every mutation runs under the write lock for its whole
/// read-modify-write, so status and timestamp always change together.
#[derive(Clone)]
pub struct LocalRegistry {
    entries: Arc<RwLock<HashMap<String, RegistryEntry>>>,
    clock: SharedClock,
}

impl LocalRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Insert or replace the entry for `definition.id`.
    ///
    /// Invalid definitions are rejected before the registry is touched.
    pub fn register(&self, definition: EndpointDefinition) -> DiscoveryResult<EndpointDefinition> {
        definition.validate()?;

        let now = self.clock.now_millis();
        let entry = RegistryEntry {
            definition: definition.clone(),
            last_check_in_at_millis: now,
        };

        let mut entries = self.entries.write().expect("registry lock");
        let replaced = entries.insert(definition.id.clone(), entry).is_some();
        drop(entries);

        info!(
            service_id = %definition.id,
            service = %definition.service_name,
            port = definition.port,
            ttl = ?definition.time_to_live_seconds,
            replaced,
            "endpoint registered"
        );
        Ok(definition)
    }

    /// Remove an entry. Returns true if it existed.
    pub fn unregister(&self, service_id: &str) -> bool {
        let mut entries = self.entries.write().expect("registry lock");
        let existed = entries.remove(service_id).is_some();
        if existed {
            info!(%service_id, "endpoint unregistered");
        }
        existed
    }

    /// Record a check-in, returning the updated definition.
    ///
    /// Unknown ids are ignored: a check-in racing an unregister or a
    /// sweep is expected, not an error.
    pub fn check_in(&self, service_id: &str, status: HealthStatus) -> Option<EndpointDefinition> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write().expect("registry lock");
        match entries.get_mut(service_id) {
            Some(entry) => {
                entry.definition.health_status = status;
                entry.last_check_in_at_millis = now;
                debug!(%service_id, %status, "check-in recorded");
                Some(entry.definition.clone())
            }
            None => {
                debug!(%service_id, "check-in for unknown service id ignored");
                None
            }
        }
    }

    pub fn check_in_ok(&self, service_id: &str) -> Option<EndpointDefinition> {
        self.check_in(service_id, HealthStatus::Pass)
    }

    /// Remove every TTL entry that has been silent past its TTL at `now_millis`.
    ///
    /// Returns the removed ids, sorted. Entries without a TTL are never
    /// removed here.
    pub fn sweep_expired(&self, now_millis: u64) -> Vec<String> {
        let mut entries = self.entries.write().expect("registry lock");
        let mut removed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now_millis))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            entries.remove(id);
        }
        drop(entries);

        removed.sort();
        for id in &removed {
            warn!(service_id = %id, "endpoint expired without check-in");
        }
        removed
    }

    /// Point-in-time copy of all live definitions.
    ///
    /// Entries already past their expiry are left out even if the sweep
    /// has not run yet.
    pub fn snapshot(&self) -> Vec<EndpointDefinition> {
        self.collect_live(|_| true)
    }

    /// Live definitions registered under `service_name`.
    pub fn snapshot_for(&self, service_name: &str) -> Vec<EndpointDefinition> {
        self.collect_live(|def| def.service_name == service_name)
    }

    pub fn get(&self, service_id: &str) -> Option<RegistryEntry> {
        let entries = self.entries.read().expect("registry lock");
        entries.get(service_id).cloned()
    }

    /// True if `service_id` is stored here, expired or not.
    pub fn contains(&self, service_id: &str) -> bool {
        self.entries.read().expect("registry lock").contains_key(service_id)
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect_live<F>(&self, keep: F) -> Vec<EndpointDefinition>
    where
        F: Fn(&EndpointDefinition) -> bool,
    {
        let now = self.clock.now_millis();
        let entries = self.entries.read().expect("registry lock");
        let mut defs: Vec<EndpointDefinition> = entries
            .values()
            .filter(|entry| !entry.is_expired(now) && keep(&entry.definition))
            .map(|entry| entry.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use waypost_core::{Clock, DiscoveryError, ManualClock};

    fn test_registry() -> (LocalRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (LocalRegistry::new(clock.clone()), clock)
    }

    #[test]
    fn register_sets_check_in_time() {
        let (registry, clock) = test_registry();
        let def = EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, 5);
        registry.register(def).unwrap();

        let entry = registry.get("orders-1").unwrap();
        assert_eq!(entry.last_check_in_at_millis, clock.now_millis());
        assert_eq!(entry.expires_at_millis(), Some(clock.now_millis() + 5_000));
    }

    #[test]
    fn register_same_id_replaces() {
        let (registry, _) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .unwrap();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-1", 9090))
            .unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].port, 9090);
    }

    #[test]
    fn huge_ttl_never_expires() {
        let (registry, clock) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, i64::MAX))
            .unwrap();

        assert_eq!(registry.get("orders-1").unwrap().expires_at_millis(), None);
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.sweep_expired(u64::MAX).is_empty());
    }

    #[test]
    fn invalid_registration_leaves_registry_untouched() {
        let (registry, _) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .unwrap();

        let err = registry
            .register(EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 9090, -3))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidRegistration(_)));
        assert_eq!(registry.get("orders-1").unwrap().definition.port, 8080);
    }

    #[test]
    fn unregister_is_idempotent() {
        let (registry, _) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .unwrap();

        assert!(registry.unregister("orders-1"));
        assert!(!registry.unregister("orders-1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn check_in_updates_status_and_time() {
        let (registry, clock) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, 5))
            .unwrap();

        clock.advance(Duration::from_secs(3));
        let updated = registry.check_in("orders-1", HealthStatus::Warn).unwrap();
        assert_eq!(updated.health_status, HealthStatus::Warn);

        let entry = registry.get("orders-1").unwrap();
        assert_eq!(entry.last_check_in_at_millis, clock.now_millis());
    }

    #[test]
    fn check_in_unknown_id_is_noop() {
        let (registry, _) = test_registry();
        assert!(registry.check_in_ok("missing-id").is_none());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn sweep_never_removes_entries_without_ttl() {
        let (registry, clock) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .unwrap();
        registry
            .register(EndpointDefinition::from_name_id_port_ttl("orders", "orders-2", 8081, 0))
            .unwrap();

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(registry.sweep_expired(clock.now_millis()).is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn sweep_respects_ttl_boundary() {
        let (registry, clock) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, 5))
            .unwrap();
        let registered_at = clock.now_millis();

        // Exactly at the boundary the entry is still alive.
        assert!(registry.sweep_expired(registered_at + 5_000).is_empty());
        assert_eq!(
            registry.sweep_expired(registered_at + 5_001),
            vec!["orders-1".to_string()]
        );
        // A second sweep finds nothing.
        assert!(registry.sweep_expired(registered_at + 10_000).is_empty());
    }

    #[test]
    fn repeated_check_ins_keep_entry_alive() {
        let (registry, clock) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, 5))
            .unwrap();

        for _ in 0..10 {
            clock.advance(Duration::from_secs(4));
            registry.check_in_ok("orders-1");
            assert!(registry.sweep_expired(clock.now_millis()).is_empty());
        }
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn snapshot_hides_expired_entries_before_sweep() {
        let (registry, clock) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, 5))
            .unwrap();
        registry
            .register(EndpointDefinition::from_name_id_port("billing", "billing-1", 7070))
            .unwrap();

        clock.advance(Duration::from_secs(6));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "billing-1");
        // Still stored until the sweep runs.
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn snapshot_for_filters_by_name() {
        let (registry, _) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .unwrap();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-2", 8081))
            .unwrap();
        registry
            .register(EndpointDefinition::from_name_id_port("billing", "billing-1", 7070))
            .unwrap();

        let orders = registry.snapshot_for("orders");
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|d| d.service_name == "orders"));
        assert!(registry.snapshot_for("unknown").is_empty());
    }

    #[test]
    fn snapshot_is_independent_copy() {
        let (registry, _) = test_registry();
        registry
            .register(EndpointDefinition::from_name_id_port("orders", "orders-1", 8080))
            .unwrap();

        let mut snapshot = registry.snapshot();
        snapshot[0].port = 1;
        snapshot.clear();

        assert_eq!(registry.snapshot()[0].port, 8080);
    }

    #[test]
    fn concurrent_check_ins_and_sweeps() {
        let (registry, clock) = test_registry();
        for i in 0..16 {
            registry
                .register(EndpointDefinition::from_name_id_port_ttl(
                    "orders",
                    &format!("orders-{i}"),
                    8000 + i,
                    5,
                ))
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                let now = clock.now_millis();
                std::thread::spawn(move || {
                    for i in 0..16 {
                        let status = if t % 2 == 0 {
                            HealthStatus::Pass
                        } else {
                            HealthStatus::Warn
                        };
                        registry.check_in(&format!("orders-{i}"), status);
                        registry.sweep_expired(now);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 16);
        assert!(snapshot.iter().all(|d| d.health_status.is_healthy()));
    }
}

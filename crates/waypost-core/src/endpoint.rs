//! Endpoint definitions and service id generation.
//!
//! An `EndpointDefinition` is one registered, network-reachable instance of
//! a logical service. Definitions are plain values: the local registry and
//! the remote cache hold copies, never references into shared state.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, DiscoveryResult};

/// Health of a registered endpoint as reported by its check-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Whether clients should route traffic to an endpoint in this state.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Pass | HealthStatus::Warn)
    }

    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Pass => "pass",
            HealthStatus::Warn => "warn",
            HealthStatus::Fail => "fail",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One registered endpoint of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub health_status: HealthStatus,
    /// Unique within the service name scope.
    pub id: String,
    /// Logical name clients resolve against.
    pub service_name: String,
    /// Host to reach the endpoint on. `None` means this host.
    pub address: Option<String>,
    pub port: u16,
    /// Absent or zero means the endpoint never expires.
    pub time_to_live_seconds: Option<i64>,
}

impl EndpointDefinition {
    /// Passing endpoint with a generated id and no TTL.
    pub fn from_name_and_port(service_name: &str, port: u16) -> Self {
        Self::from_name_id_port(service_name, &generated_id(service_name, port), port)
    }

    /// Passing endpoint with a generated id that expires without check-ins.
    pub fn from_name_and_port_with_ttl(service_name: &str, port: u16, ttl_seconds: i64) -> Self {
        Self::from_name_id_port_ttl(
            service_name,
            &generated_id(service_name, port),
            port,
            ttl_seconds,
        )
    }

    pub fn from_name_id_port_ttl(
        service_name: &str,
        id: &str,
        port: u16,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            time_to_live_seconds: Some(ttl_seconds),
            ..Self::from_name_id_port(service_name, id, port)
        }
    }

    pub fn from_name_id_port(service_name: &str, id: &str, port: u16) -> Self {
        Self {
            health_status: HealthStatus::Pass,
            id: id.to_string(),
            service_name: service_name.to_string(),
            address: None,
            port,
            time_to_live_seconds: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_health_status(mut self, status: HealthStatus) -> Self {
        self.health_status = status;
        self
    }

    /// Reject definitions that must never reach a registry.
    ///
    /// Checked before any state is touched, so a rejected registration
    /// leaves the registry exactly as it was.
    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(DiscoveryError::InvalidRegistration(
                "service name must not be empty".to_string(),
            ));
        }
        if self.id.trim().is_empty() {
            return Err(DiscoveryError::InvalidRegistration(format!(
                "service id for '{}' must not be empty",
                self.service_name
            )));
        }
        if self.port == 0 {
            return Err(DiscoveryError::InvalidRegistration(format!(
                "endpoint '{}' has no port",
                self.id
            )));
        }
        match self.time_to_live_seconds {
            Some(ttl) if ttl < 0 => {
                return Err(DiscoveryError::InvalidRegistration(format!(
                    "endpoint '{}' has negative ttl {ttl}s",
                    self.id
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// The effective TTL, `None` when the endpoint never expires.
    pub fn ttl(&self) -> Option<Duration> {
        match self.time_to_live_seconds {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
            _ => None,
        }
    }

    /// `host:port`, with `localhost` standing in for an absent address.
    pub fn host_port(&self) -> String {
        format!(
            "{}:{}",
            self.address.as_deref().unwrap_or("localhost"),
            self.port
        )
    }
}

fn generated_id(service_name: &str, port: u16) -> String {
    format!("{service_name}.{}", unique_string(port))
}

/// Unique suffix for generated service ids, `{port}-{hostname}`.
///
/// Dots in the hostname are replaced with dashes. When the hostname cannot
/// be resolved a random UUID takes its place, so this never fails.
pub fn unique_string(port: u16) -> String {
    unique_string_with(port, || {
        hostname::get().and_then(|name| {
            name.into_string()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hostname is not utf-8"))
        })
    })
}

/// [`unique_string`] with a caller-supplied hostname resolver.
pub fn unique_string_with<F>(port: u16, resolve_hostname: F) -> String
where
    F: FnOnce() -> io::Result<String>,
{
    match resolve_hostname() {
        Ok(host) if !host.trim().is_empty() => format!("{port}-{}", host.replace('.', "-")),
        _ => format!("{port}-{}", uuid::Uuid::new_v4()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_and_port_generates_id() {
        let def = EndpointDefinition::from_name_and_port("orders", 8080);
        assert_eq!(def.health_status, HealthStatus::Pass);
        assert!(def.id.starts_with("orders.8080-"));
        assert_eq!(def.service_name, "orders");
        assert!(def.address.is_none());
        assert!(def.ttl().is_none());
    }

    #[test]
    fn ttl_variants_set_ttl() {
        let def = EndpointDefinition::from_name_and_port_with_ttl("orders", 8080, 5);
        assert_eq!(def.ttl(), Some(Duration::from_secs(5)));

        let def = EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, 10);
        assert_eq!(def.id, "orders-1");
        assert_eq!(def.time_to_live_seconds, Some(10));
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let def = EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, 0);
        assert!(def.ttl().is_none());
        assert!(def.validate().is_ok());
    }

    #[test]
    fn unique_string_uses_hostname() {
        let id = unique_string_with(8080, || Ok("web.prod.internal".to_string()));
        assert_eq!(id, "8080-web-prod-internal");
    }

    #[test]
    fn unique_string_falls_back_to_uuid() {
        let id = unique_string_with(8080, || {
            Err(io::Error::new(io::ErrorKind::NotFound, "no host"))
        });
        let suffix = id.strip_prefix("8080-").unwrap();
        assert!(uuid::Uuid::parse_str(suffix).is_ok());

        // Each fallback is fresh.
        let other = unique_string_with(8080, || {
            Err(io::Error::new(io::ErrorKind::NotFound, "no host"))
        });
        assert_ne!(id, other);
    }

    #[test]
    fn validate_rejects_bad_input() {
        let no_port = EndpointDefinition::from_name_id_port("orders", "orders-1", 0);
        assert!(matches!(
            no_port.validate(),
            Err(DiscoveryError::InvalidRegistration(_))
        ));

        let negative = EndpointDefinition::from_name_id_port_ttl("orders", "orders-1", 8080, -1);
        assert!(matches!(
            negative.validate(),
            Err(DiscoveryError::InvalidRegistration(_))
        ));

        let no_name = EndpointDefinition::from_name_id_port("", "x", 8080);
        assert!(no_name.validate().is_err());

        let no_id = EndpointDefinition::from_name_id_port("orders", " ", 8080);
        assert!(no_id.validate().is_err());
    }

    #[test]
    fn host_port_defaults_to_localhost() {
        let def = EndpointDefinition::from_name_id_port("orders", "o-1", 8080);
        assert_eq!(def.host_port(), "localhost:8080");
        assert_eq!(def.with_address("10.0.0.5").host_port(), "10.0.0.5:8080");
    }

    #[test]
    fn health_status_serializes_snake_case() {
        let json = serde_json::to_string(&HealthStatus::Warn).unwrap();
        assert_eq!(json, "\"warn\"");
        assert!(HealthStatus::Warn.is_healthy());
        assert!(!HealthStatus::Fail.is_healthy());
        assert!(!HealthStatus::Unknown.is_healthy());
    }
}

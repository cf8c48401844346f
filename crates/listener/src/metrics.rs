//! Listener metrics.
//!
//! Counters are created unregistered; call [`ListenerMetrics::register`] to
//! expose them on a registry. Clones share the same counters.
//!
//! - `dynlistener_certificate_updates_total`: SAN set changes persisted
//! - `dynlistener_certificate_renewals_total`: expiry renewals persisted
//! - `dynlistener_certificate_loads_total`: serving certificates parsed
//! - `dynlistener_handshake_failures_total`: failed TLS handshakes
//! - `dynlistener_connections_closed_total`: connections closed after rotation

use prometheus::{IntCounter, Registry};

#[derive(Debug, Clone)]
pub struct ListenerMetrics {
    pub certificate_updates: IntCounter,
    pub certificate_renewals: IntCounter,
    pub certificate_loads: IntCounter,
    pub handshake_failures: IntCounter,
    pub connections_closed: IntCounter,
}

impl ListenerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            certificate_updates: IntCounter::new(
                "dynlistener_certificate_updates_total",
                "Serving certificate SAN updates persisted",
            )?,
            certificate_renewals: IntCounter::new(
                "dynlistener_certificate_renewals_total",
                "Serving certificate renewals persisted",
            )?,
            certificate_loads: IntCounter::new(
                "dynlistener_certificate_loads_total",
                "Serving certificates loaded from storage",
            )?,
            handshake_failures: IntCounter::new(
                "dynlistener_handshake_failures_total",
                "TLS handshakes that failed",
            )?,
            connections_closed: IntCounter::new(
                "dynlistener_connections_closed_total",
                "Connections closed after a certificate change",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.certificate_updates.clone()))?;
        registry.register(Box::new(self.certificate_renewals.clone()))?;
        registry.register(Box::new(self.certificate_loads.clone()))?;
        registry.register(Box::new(self.handshake_failures.clone()))?;
        registry.register(Box::new(self.connections_closed.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = ListenerMetrics::new().unwrap();
        metrics.register(&registry).unwrap();

        metrics.clone().certificate_updates.inc();

        let families = registry.gather();
        assert_eq!(families.len(), 5);
        assert_eq!(metrics.certificate_updates.get(), 1);

        let text = prometheus::TextEncoder::new()
            .encode_to_string(&families)
            .unwrap();
        assert!(text.contains("dynlistener_certificate_updates_total 1"));
    }

    #[test]
    fn test_double_register_fails() {
        let registry = Registry::new();
        let metrics = ListenerMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}

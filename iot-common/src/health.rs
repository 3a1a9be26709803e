use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

/// Health reporting for the loops of an ingestion process.
///
/// Each loop registers a component and must report healthy more often than
/// its deadline. The process is healthy only if every registered component
/// recently reported healthy; a component that misses its deadline shows up
/// as `Stalled`.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Set when the HealthyUntil deadline is reached
    Stalled,
    /// The component finished its work on purpose
    Stopped,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                if let Some(previous) = components.insert(self.component.clone(), status.clone())
                {
                    if !matches!(previous, ComponentStatus::HealthyUntil(_))
                        || !matches!(status, ComponentStatus::HealthyUntil(_))
                    {
                        info!(component = %self.component, ?status, "component status changed");
                    }
                }
            }
            Err(_) => warn!("failed to report health status, registry is poisoned"),
        }
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        info!(registry = %self.name, component, "registered health component");
        handle
    }

    /// Returns the overall process status, computed from the status of all the components
    /// currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            return HealthStatus::default();
        };
        let now = time::OffsetDateTime::now_utc();

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let current = match component {
                ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(
                current,
                ComponentStatus::HealthyUntil(_) | ComponentStatus::Stopped
            ) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), current);
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");

        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_components_must_all_report() {
        let registry = HealthRegistry::new("liveness");
        let producer = registry.register("producer", Duration::from_secs(30));
        let consumer = registry.register("consumer", Duration::from_secs(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["producer"], ComponentStatus::Starting);

        producer.report_healthy();
        assert!(!registry.get_status().healthy);

        consumer.report_healthy();
        assert!(registry.get_status().healthy);

        consumer.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_stopped_component_stays_healthy() {
        let registry = HealthRegistry::new("liveness");
        let producer = registry.register("producer", Duration::from_secs(30));

        producer.report_status(ComponentStatus::Stopped);

        assert!(registry.get_status().healthy);
    }

    #[test]
    fn test_expired_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry.register("consumer", Duration::ZERO);

        consumer.report_healthy();
        let status = registry.get_status();

        assert!(!status.healthy);
        assert_eq!(status.components["consumer"], ComponentStatus::Stalled);
    }
}

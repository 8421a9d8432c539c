use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tracing::{info, warn};

/// Liveness of the consumer's long running tasks.
///
/// The poll loop reports `HealthyUntil` on every iteration. Worker units
/// report `Idle` while waiting on their queue and `BusyUntil` while a handler
/// runs, so a handler that never returns shows up as `Stalled` once the
/// deadline passes. The consumer is healthy only when every component is.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
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
    /// Set on registration, before the component first reports
    Starting,
    /// Loop component that must report again before the deadline
    HealthyUntil(OffsetDateTime),
    /// Worker waiting on an empty queue
    Idle,
    /// Worker inside a handler that should return before the deadline
    BusyUntil(OffsetDateTime),
    Unhealthy,
    /// A deadline was missed
    Stalled,
    /// The component exited, normally on close
    Stopped,
}

impl ComponentStatus {
    fn resolve(&self, now: OffsetDateTime) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) | ComponentStatus::BusyUntil(until)
                if until.le(&now) =>
            {
                ComponentStatus::Stalled
            }
            status => status.clone(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self.resolve(OffsetDateTime::now_utc()) {
            ComponentStatus::HealthyUntil(_)
            | ComponentStatus::Idle
            | ComponentStatus::BusyUntil(_) => true,
            _ => false,
        }
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_busy(&self) {
        self.report_status(ComponentStatus::BusyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_idle(&self) {
        self.report_status(ComponentStatus::Idle)
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Mark every registered component as stopped
    pub fn stop_all(&self) {
        if let Ok(mut map) = self.components.write() {
            for status in map.values_mut() {
                *status = ComponentStatus::Stopped;
            }
        }
    }

    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned registry lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let components: HashMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| (name.clone(), status.resolve(now)))
            .collect();
        let healthy =
            !components.is_empty() && components.values().all(ComponentStatus::is_healthy);

        match healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, components),
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    #[test]
    fn test_defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_loop_and_workers() {
        let registry = HealthRegistry::new("liveness");
        let poll_loop = registry.register("poll_loop".to_string(), Duration::from_secs(30));
        let worker = registry.register("worker_0".to_string(), Duration::from_secs(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("poll_loop"),
            Some(&ComponentStatus::Starting)
        );

        poll_loop.report_healthy();
        worker.report_idle();
        assert!(registry.get_status().healthy);

        worker.report_busy();
        assert!(registry.get_status().healthy);

        worker.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let worker = registry.register("worker_3".to_string(), Duration::from_secs(30));

        worker.report_status(ComponentStatus::BusyUntil(
            OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
        ));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker_3"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn test_stop_all() {
        let registry = HealthRegistry::new("liveness");
        let poll_loop = registry.register("poll_loop".to_string(), Duration::from_secs(30));
        poll_loop.report_healthy();
        assert!(registry.get_status().healthy);

        registry.stop_all();
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("poll_loop"),
            Some(&ComponentStatus::Stopped)
        );
    }

    #[test]
    fn test_into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}

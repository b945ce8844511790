use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Liveness reporting for the asynchronous loops of a relay process.
///
/// A relay process runs one consumption loop per assigned partition, plus the
/// rdkafka client threads behind the producer. The process can only be trusted
/// to make progress if every loop keeps reporting.
///
/// HealthRegistry lets any number of components register and report. The
/// process status combines the individual statuses:
///   - if any running component is unhealthy, the process is unhealthy
///   - if all running components recently reported healthy, the process is healthy
///   - a component that misses its reporting deadline is stalled, and fails the check
///   - a component that stopped cleanly no longer counts towards the result
///
/// Liveness and readiness are separate probes: use one registry per probe.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all running components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Maps the overall status to an HTTP status code, and prints each
    /// component status in the body for debugging.
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
    /// Set when a component is newly registered
    Starting,
    /// Recently reported healthy, must report again before the deadline
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy, e.g. a partition the broker terminated
    Unhealthy,
    /// Set at read time when the HealthyUntil deadline has passed
    Stalled,
    /// The component finished its work and exited cleanly
    Stopped,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Asynchronously report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    /// Mark the component as cleanly stopped.
    pub async fn report_stopped(&self) {
        self.report_status(ComponentStatus::Stopped).await
    }

    /// Synchronously report healthy. Used from rdkafka callbacks, which run
    /// on librdkafka threads outside of the tokio runtime.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    /// Synchronously report component status, returns when the message is queued.
    pub fn report_status_blocking(&self, status: ComponentStatus) {
        // blocking_send panics inside a runtime, hand it over to a task instead
        if let Ok(handle) = runtime::Handle::try_current() {
            let reporter = self.clone();
            handle.spawn(async move { reporter.report_status(status).await });
            return;
        }

        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.blocking_send(message) {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(64);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned lock: the probes will fail and the process restart
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Registers a new component. The returned handle is given to the
    /// component so it can report its status on a schedule.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Returns the overall process status, computed from every registered
    /// component. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let running = components
            .values()
            .filter(|status| **status != ComponentStatus::Stopped)
            .count();
        let result = HealthStatus {
            // unhealthy until at least one component is running
            healthy: running > 0,
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        let result = components
            .iter()
            .fold(result, |mut result, (name, status)| {
                match status {
                    ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                        _ = result.components.insert(name.clone(), status.clone())
                    }
                    ComponentStatus::HealthyUntil(_) => {
                        result.healthy = false;
                        _ = result
                            .components
                            .insert(name.clone(), ComponentStatus::Stalled)
                    }
                    ComponentStatus::Stopped => {
                        _ = result.components.insert(name.clone(), status.clone())
                    }
                    _ => {
                        result.healthy = false;
                        _ = result.components.insert(name.clone(), status.clone())
                    }
                }
                result
            });
        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{ComponentStatus, HealthRegistry, HealthStatus};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::ops::Sub;
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn one_partition_reporting() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("orders:0".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("orders:0"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("orders:0"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn stale_report_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("orders:0".to_string(), Duration::from_secs(30))
            .await;

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("orders:0"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn stopped_components_are_ignored() {
        let registry = HealthRegistry::new("liveness");
        let first = registry
            .register("orders:0".to_string(), Duration::from_secs(30))
            .await;
        let second = registry
            .register("orders:1".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;

        first.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("orders:0") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        // A cleanly stopped partition no longer holds the process back
        second.report_stopped().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        // But once nothing is running, the process is not live anymore
        first.report_stopped().await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn into_response() {
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

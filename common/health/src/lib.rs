use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the components of the service.
///
/// The plugin server runs several long-lived loops (queue consumer, worker
/// pool, scheduler), and the process can only be trusted with user data if
/// all of them are running and reporting. Each loop registers a component
/// and must report healthy more often than its deadline; a component that
/// goes quiet flips the whole process check to failing.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True iff every registered component is currently healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
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
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
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
    /// Report healthy; must be called more frequently than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    /// Synchronous variant for callers outside async contexts (e.g. librdkafka
    /// callback threads). Spawns instead when already inside a runtime.
    pub fn report_healthy_blocking(&self) {
        let message = HealthMessage {
            component: self.component.clone(),
            status: ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc().add(self.deadline),
            ),
        };
        if let Ok(h) = runtime::Handle::try_current() {
            let m = self.clone();
            h.spawn(async move { m.report_status(message.status).await });
        } else if let Err(err) = self.sender.blocking_send(message) {
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
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
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
                    // Poisoned mutex: the probes will fail and the process restart
                    warn!("poisoned HealthRegistry mutex")
                }
            }
        });

        registry
    }

    /// Registers a new component. The returned handle is given to the
    /// component so it can report on its own cadence.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// The combined process status; usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry mutex");

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            // Unhealthy until at least one component has registered
            healthy: !components.is_empty(),
            components: Default::default(),
        };

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone());
                }
            }
        }

        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    async fn assert_eventually<F: Fn() -> bool>(check: F) {
        let deadline = time::OffsetDateTime::now_utc().add(Duration::from_secs(5));
        while !check() && time::OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("consumer".to_string(), Duration::from_secs(30))
            .await;
        assert_eventually(|| registry.get_status().components.len() == 1).await;
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("scheduler".to_string(), Duration::from_secs(30))
            .await;

        handle.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc().sub(Duration::from_secs(1)),
            ))
            .await;
        assert_eventually(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("scheduler"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry
            .register("consumer".to_string(), Duration::from_secs(30))
            .await;
        let workers = registry
            .register("workers".to_string(), Duration::from_secs(30))
            .await;
        assert_eventually(|| registry.get_status().components.len() == 2).await;

        consumer.report_healthy().await;
        assert_eventually(|| {
            registry.get_status().components.get("consumer") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        workers.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;
    }
}

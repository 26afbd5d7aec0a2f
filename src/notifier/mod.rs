//! Notifier
//!
//! Consumes the typed event stream produced by the trigger, controller and
//! drift detector, matches events against the configured routes and
//! dispatches them to receivers. Delivery is best effort from a bounded
//! queue; overflow drops the oldest event and bumps a counter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::apistore::EnvironmentStore;
use crate::config::{NotificationRoute, Notifications};
use crate::errors::PipedError;
use crate::model::Deployment;
use crate::queue::BoundedQueue;

const QUEUE_CAPACITY: usize = 100;

/// A typed internal event worth telling humans about.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    DeploymentTriggered { deployment: Box<Deployment> },
    DeploymentPlanned { deployment: Box<Deployment> },
    DeploymentSucceeded { deployment: Box<Deployment> },
    DeploymentFailed { deployment: Box<Deployment>, reason: String },
    DeploymentCancelled { deployment: Box<Deployment>, commander: String },
    ApplicationOutOfSync { application_id: String, env_id: String, reason: String },
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationEvent::DeploymentTriggered { .. } => "DEPLOYMENT_TRIGGERED",
            NotificationEvent::DeploymentPlanned { .. } => "DEPLOYMENT_PLANNED",
            NotificationEvent::DeploymentSucceeded { .. } => "DEPLOYMENT_SUCCEEDED",
            NotificationEvent::DeploymentFailed { .. } => "DEPLOYMENT_FAILED",
            NotificationEvent::DeploymentCancelled { .. } => "DEPLOYMENT_CANCELLED",
            NotificationEvent::ApplicationOutOfSync { .. } => "APPLICATION_OUT_OF_SYNC",
        }
    }

    pub fn application_id(&self) -> &str {
        match self {
            NotificationEvent::DeploymentTriggered { deployment }
            | NotificationEvent::DeploymentPlanned { deployment }
            | NotificationEvent::DeploymentSucceeded { deployment }
            | NotificationEvent::DeploymentFailed { deployment, .. }
            | NotificationEvent::DeploymentCancelled { deployment, .. } => {
                &deployment.application_id
            }
            NotificationEvent::ApplicationOutOfSync { application_id, .. } => application_id,
        }
    }

    pub fn env_id(&self) -> &str {
        match self {
            NotificationEvent::DeploymentTriggered { deployment }
            | NotificationEvent::DeploymentPlanned { deployment }
            | NotificationEvent::DeploymentSucceeded { deployment }
            | NotificationEvent::DeploymentFailed { deployment, .. }
            | NotificationEvent::DeploymentCancelled { deployment, .. } => &deployment.env_id,
            NotificationEvent::ApplicationOutOfSync { env_id, .. } => env_id,
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    application_id: &'a str,
    env_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    env_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
}

pub struct Notifier {
    config: Notifications,
    queue: BoundedQueue<NotificationEvent>,
    client: reqwest::Client,
    environments: Option<Arc<EnvironmentStore>>,
}

impl Notifier {
    pub fn new(config: Notifications) -> Self {
        Self {
            config,
            queue: BoundedQueue::new(QUEUE_CAPACITY),
            client: reqwest::Client::new(),
            environments: None,
        }
    }

    /// Resolve environment names into dispatched payloads.
    pub fn with_environment_store(mut self, environments: Arc<EnvironmentStore>) -> Self {
        self.environments = Some(environments);
        self
    }

    /// Enqueue an event without blocking the emitter.
    pub fn notify(&self, event: NotificationEvent) {
        if self.queue.push(event) > 0 {
            metrics::counter!("piped_notifier_events_dropped_total").increment(1);
        }
    }

    pub async fn run(
        &self,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), PipedError> {
        info!("Notifier starting...");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Notifier shutting down...");
                    return Ok(());
                }
                _ = self.queue.wait() => {}
            }

            while let Some(event) = self.queue.try_pop() {
                self.dispatch(&event).await;
            }
        }
    }

    async fn dispatch(&self, event: &NotificationEvent) {
        for route in self.matching_routes(event) {
            let Some(receiver) = self.config.receiver(&route.receiver) else {
                error!("Route {} names an unknown receiver {}", route.name, route.receiver);
                continue;
            };
            let Some(webhook) = &receiver.webhook else {
                continue;
            };

            let (deployment_id, summary) = match event {
                NotificationEvent::DeploymentTriggered { deployment }
                | NotificationEvent::DeploymentPlanned { deployment }
                | NotificationEvent::DeploymentSucceeded { deployment }
                | NotificationEvent::DeploymentFailed { deployment, .. }
                | NotificationEvent::DeploymentCancelled { deployment, .. } => {
                    (Some(deployment.id.as_str()), Some(deployment.summary.as_str()))
                }
                NotificationEvent::ApplicationOutOfSync { reason, .. } => {
                    (None, Some(reason.as_str()))
                }
            };
            let env_name = match &self.environments {
                Some(store) => store.get(event.env_id()).await.ok().map(|e| e.name),
                None => None,
            };
            let payload = WebhookPayload {
                event: event.name(),
                application_id: event.application_id(),
                env_id: event.env_id(),
                env_name,
                deployment_id,
                summary,
            };

            debug!("Dispatching {} to {}", event.name(), route.receiver);
            let result = self
                .client
                .post(&webhook.url)
                .timeout(Duration::from_secs(10))
                .json(&payload)
                .send()
                .await;
            if let Err(e) = result {
                // Best effort only.
                error!("Failed to deliver {} to {}: {}", event.name(), webhook.url, e);
            }
        }
    }

    fn matching_routes(&self, event: &NotificationEvent) -> Vec<&NotificationRoute> {
        self.config
            .routes
            .iter()
            .filter(|r| {
                (r.events.is_empty() || r.events.iter().any(|e| e == event.name()))
                    && (r.apps.is_empty()
                        || r.apps.iter().any(|a| a == event.application_id()))
                    && (r.envs.is_empty() || r.envs.iter().any(|e| e == event.env_id()))
            })
            .collect()
    }

    /// Events dropped due to queue overflow since startup.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }
}

/// A notifier with no routes, for wiring in tests.
pub fn noop() -> Arc<Notifier> {
    Arc::new(Notifier::new(Notifications::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotificationReceiver, NotificationRoute};

    fn event(app: &str) -> NotificationEvent {
        NotificationEvent::ApplicationOutOfSync {
            application_id: app.to_string(),
            env_id: "env-1".to_string(),
            reason: "drift".to_string(),
        }
    }

    #[test]
    fn test_route_matching() {
        let notifier = Notifier::new(Notifications {
            routes: vec![NotificationRoute {
                name: "drift-route".to_string(),
                receiver: "hook".to_string(),
                events: vec!["APPLICATION_OUT_OF_SYNC".to_string()],
                apps: vec!["app-1".to_string()],
                envs: Vec::new(),
            }],
            receivers: vec![NotificationReceiver {
                name: "hook".to_string(),
                webhook: None,
            }],
        });

        assert_eq!(notifier.matching_routes(&event("app-1")).len(), 1);
        assert!(notifier.matching_routes(&event("app-2")).is_empty());
    }

    #[test]
    fn test_overflow_counts_drops() {
        let notifier = Notifier::new(Notifications::default());
        for _ in 0..(QUEUE_CAPACITY + 5) {
            notifier.notify(event("app-1"));
        }
        assert_eq!(notifier.dropped_events(), 5);
    }
}

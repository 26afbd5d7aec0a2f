//! Deployment store

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::apiclient::PipedService;
use crate::errors::PipedError;
use crate::model::{Deployment, DeploymentStatus};

/// Periodically refreshed cache of this piped's not-completed deployments.
pub struct DeploymentStore {
    api: Arc<dyn PipedService>,
    snapshot: RwLock<Arc<HashMap<String, Deployment>>>,
    sync_interval: Duration,
}

impl DeploymentStore {
    pub fn new(api: Arc<dyn PipedService>, sync_interval: Duration) -> Self {
        Self {
            api,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            sync_interval,
        }
    }

    pub async fn run<S, F>(
        &self,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), PipedError>
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!("Deployment store starting...");
        self.refresh().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Deployment store shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.sync_interval) => {}
            }
            self.refresh().await;
        }
    }

    /// Run one refresh pass immediately.
    pub async fn refresh(&self) {
        match self.api.list_not_completed_deployments().await {
            Ok(deployments) => {
                debug!("Refreshed {} deployments", deployments.len());
                let map: HashMap<String, Deployment> = deployments
                    .into_iter()
                    .map(|d| (d.id.clone(), d))
                    .collect();
                let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                *snapshot = Arc::new(map);
            }
            Err(e) => {
                error!("Failed to refresh deployment list: {}", e);
            }
        }
    }

    fn snapshot(&self) -> Arc<HashMap<String, Deployment>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Read-only snapshot access to the deployment store.
#[derive(Clone)]
pub struct DeploymentLister {
    store: Arc<DeploymentStore>,
}

impl DeploymentLister {
    pub fn new(store: Arc<DeploymentStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Vec<Deployment> {
        self.store.snapshot().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Deployment> {
        self.store.snapshot().get(id).cloned()
    }

    /// Deployments waiting to be planned.
    pub fn list_pendings(&self) -> Vec<Deployment> {
        self.store
            .snapshot()
            .values()
            .filter(|d| d.status == DeploymentStatus::Pending)
            .cloned()
            .collect()
    }

    /// Whether a deployment already exists for the application and commit,
    /// in any state. Used by the trigger for idempotency.
    pub fn exists_for_commit(&self, application_id: &str, commit_hash: &str) -> bool {
        self.store.snapshot().values().any(|d| {
            d.application_id == application_id && d.trigger.commit.hash == commit_hash
        })
    }

    /// Whether the application has a deployment being driven right now.
    pub fn has_in_progress(&self, application_id: &str) -> bool {
        self.store.snapshot().values().any(|d| {
            d.application_id == application_id
                && matches!(
                    d.status,
                    DeploymentStatus::Planned
                        | DeploymentStatus::Running
                        | DeploymentStatus::RollingBack
                )
        })
    }
}

//! Application store

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::apiclient::PipedService;
use crate::errors::PipedError;
use crate::model::Application;

/// Periodically refreshed cache of the applications managed by this piped.
pub struct ApplicationStore {
    api: Arc<dyn PipedService>,
    snapshot: RwLock<Arc<HashMap<String, Application>>>,
    sync_interval: Duration,
}

impl ApplicationStore {
    pub fn new(api: Arc<dyn PipedService>, sync_interval: Duration) -> Self {
        Self {
            api,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            sync_interval,
        }
    }

    /// Run the refresh loop until shutdown. Returns Ok only on shutdown;
    /// any other exit is a fatal error for the supervisor.
    pub async fn run<S, F>(
        &self,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), PipedError>
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!("Application store starting...");
        self.refresh().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Application store shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.sync_interval) => {}
            }
            self.refresh().await;
        }
    }

    /// Run one refresh pass immediately.
    pub async fn refresh(&self) {
        match self.api.list_applications().await {
            Ok(applications) => {
                debug!("Refreshed {} applications", applications.len());
                let map: HashMap<String, Application> = applications
                    .into_iter()
                    .map(|a| (a.id.clone(), a))
                    .collect();
                let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                *snapshot = Arc::new(map);
            }
            Err(e) => {
                // Keep serving the prior snapshot.
                error!("Failed to refresh application list: {}", e);
            }
        }
    }

    fn snapshot(&self) -> Arc<HashMap<String, Application>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Read-only snapshot access to the application store.
#[derive(Clone)]
pub struct ApplicationLister {
    store: Arc<ApplicationStore>,
}

impl ApplicationLister {
    pub fn new(store: Arc<ApplicationStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Vec<Application> {
        self.store.snapshot().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Application> {
        self.store.snapshot().get(id).cloned()
    }

    /// Applications whose source lives in the given repository.
    pub fn list_by_repo(&self, repo_id: &str) -> Vec<Application> {
        self.store
            .snapshot()
            .values()
            .filter(|a| a.git_path.repo_id == repo_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiclient::FakeApiClient;
    use crate::model::{ApplicationGitPath, ApplicationKind};

    fn app(id: &str) -> Application {
        Application {
            id: id.to_string(),
            name: id.to_string(),
            env_id: "env-1".to_string(),
            kind: ApplicationKind::Kubernetes,
            git_path: ApplicationGitPath::default(),
            cloud_provider: "kubernetes-default".to_string(),
            disabled: false,
            most_recent_successful_commit_hash: String::new(),
            sync_state: None,
        }
    }

    #[tokio::test]
    async fn test_snapshot_isolation_across_refresh() {
        let api = Arc::new(FakeApiClient::new());
        api.set_applications(vec![app("a"), app("b")]);

        let store = Arc::new(ApplicationStore::new(
            api.clone(),
            Duration::from_secs(30),
        ));
        store.refresh().await;

        // A reader holding the snapshot keeps its point-in-time view.
        let before = store.snapshot();
        assert_eq!(before.len(), 2);

        api.set_applications(vec![app("a")]);
        store.refresh().await;

        assert_eq!(before.len(), 2);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_lister_lookup() {
        let api = Arc::new(FakeApiClient::new());
        api.set_applications(vec![app("a")]);

        let store = Arc::new(ApplicationStore::new(api, Duration::from_secs(30)));
        store.refresh().await;

        let lister = ApplicationLister::new(store);
        assert!(lister.get("a").is_some());
        assert!(lister.get("missing").is_none());
        assert_eq!(lister.list_by_repo("").len(), 1);
    }
}

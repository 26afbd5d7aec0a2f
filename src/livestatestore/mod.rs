//! Live-state store
//!
//! Maintains, per cloud provider, an eventually-consistent cache of the
//! resources managed for each application. Providers with live-state
//! support are refreshed on a timer; changed snapshots are published to a
//! bounded drop-oldest channel consumed by the reporter, so callers are
//! never blocked.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::apistore::ApplicationLister;
use crate::cloudprovider::{Manifest, ProviderRegistry};
use crate::errors::PipedError;
use crate::model::ApplicationKind;
use crate::queue::BoundedQueue;

/// Default interval between live reads.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Capacity of the snapshot event channel.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// An immutable point-in-time view of an application's live resources.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub application_id: String,
    pub env_id: String,
    pub kind: ApplicationKind,
    /// Bumped every time the resource set changes
    pub version: u64,
    pub resources: Vec<Manifest>,
    pub taken_at: DateTime<Utc>,
}

/// Per-application snapshot cache plus the change event channel.
pub struct LiveStateStore {
    app_lister: ApplicationLister,
    providers: Arc<ProviderRegistry>,
    snapshots: RwLock<Arc<HashMap<String, Arc<Snapshot>>>>,
    /// Digest of the last published resource set per application
    digests: RwLock<HashMap<String, String>>,
    events: Arc<BoundedQueue<Arc<Snapshot>>>,
    refresh_interval: Duration,
}

impl LiveStateStore {
    pub fn new(
        app_lister: ApplicationLister,
        providers: Arc<ProviderRegistry>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            app_lister,
            providers,
            snapshots: RwLock::new(Arc::new(HashMap::new())),
            digests: RwLock::new(HashMap::new()),
            events: Arc::new(BoundedQueue::new(EVENT_QUEUE_CAPACITY)),
            refresh_interval,
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
        info!("Live state store starting...");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Live state store shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.refresh_interval) => {}
            }
            self.refresh_all().await;
        }
    }

    pub(crate) async fn refresh_all(&self) {
        for app in self.app_lister.list() {
            if app.disabled {
                continue;
            }
            let Some(provider) = self.providers.get(&app.cloud_provider) else {
                continue;
            };

            match provider.live_manifests(&app).await {
                Ok(resources) => self.store_snapshot(&app.id, &app.env_id, app.kind, resources),
                Err(e) if e.is_not_found() => {
                    // Pull-only provider; the snapshot stays unpopulated.
                }
                Err(e) => {
                    error!("Failed to read live state of {}: {}", app.id, e);
                }
            }
        }
    }

    fn store_snapshot(
        &self,
        application_id: &str,
        env_id: &str,
        kind: ApplicationKind,
        resources: Vec<Manifest>,
    ) {
        let digest = digest_of(&resources);
        let changed = {
            let digests = self.digests.read().unwrap_or_else(|e| e.into_inner());
            digests.get(application_id) != Some(&digest)
        };

        let prev_version = {
            let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
            snapshots
                .get(application_id)
                .map(|s| s.version)
                .unwrap_or(0)
        };

        let snapshot = Arc::new(Snapshot {
            application_id: application_id.to_string(),
            env_id: env_id.to_string(),
            kind,
            version: if changed { prev_version + 1 } else { prev_version },
            resources,
            taken_at: Utc::now(),
        });

        {
            let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
            let mut map: HashMap<String, Arc<Snapshot>> = (**snapshots).clone();
            map.insert(application_id.to_string(), snapshot.clone());
            *snapshots = Arc::new(map);
        }

        if changed {
            debug!(
                "Live state of {} changed, publishing version {}",
                application_id, snapshot.version
            );
            let mut digests = self.digests.write().unwrap_or_else(|e| e.into_inner());
            digests.insert(application_id.to_string(), digest);
            drop(digests);

            if self.events.push(snapshot) > 0 {
                metrics::counter!("piped_livestate_events_dropped_total").increment(1);
            }
        }
    }

    pub fn getter(self: &Arc<Self>) -> LiveStateGetter {
        LiveStateGetter {
            store: self.clone(),
        }
    }

    /// The change channel, consumed by the reporter.
    pub fn events(&self) -> Arc<BoundedQueue<Arc<Snapshot>>> {
        self.events.clone()
    }
}

/// Read-only snapshot access.
#[derive(Clone)]
pub struct LiveStateGetter {
    store: Arc<LiveStateStore>,
}

impl LiveStateGetter {
    /// The latest snapshot for the application; None until populated.
    pub fn get(&self, application_id: &str) -> Option<Arc<Snapshot>> {
        let snapshots = self
            .store
            .snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner());
        snapshots.get(application_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Snapshot>> {
        let snapshots = self
            .store
            .snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner());
        snapshots.values().cloned().collect()
    }
}

fn digest_of(resources: &[Manifest]) -> String {
    let mut hasher = Sha256::new();
    for manifest in resources {
        hasher.update(manifest.key.to_string().as_bytes());
        if let Ok(body) = serde_json::to_vec(&manifest.data) {
            hasher.update(&body);
        }
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::ResourceKey;

    fn resource(name: &str, replicas: u64) -> Manifest {
        Manifest::new(
            ResourceKey::new("apps", "Deployment", "default", name),
            serde_json::json!({"spec": {"replicas": replicas}}),
        )
    }

    fn store() -> LiveStateStore {
        use crate::apiclient::FakeApiClient;
        use crate::apistore::ApplicationStore;
        use crate::config::PipedSpec;
        use crate::toolregistry::ToolRegistry;

        let api = Arc::new(FakeApiClient::new());
        let app_store = Arc::new(ApplicationStore::new(api, Duration::from_secs(30)));
        let spec: PipedSpec = serde_yaml::from_str(
            "apiAddress: a\nprojectID: p\npipedID: i\npipedKeyFile: /k\n",
        )
        .unwrap();
        let providers = Arc::new(ProviderRegistry::from_spec(
            &spec,
            Arc::new(ToolRegistry::new("/tmp/tools")),
        ));
        LiveStateStore::new(
            ApplicationLister::new(app_store),
            providers,
            DEFAULT_REFRESH_INTERVAL,
        )
    }

    #[test]
    fn test_unchanged_snapshot_publishes_once() {
        let store = Arc::new(store());
        let events = store.events();

        store.store_snapshot("app-1", "env-1", ApplicationKind::Kubernetes, vec![resource("a", 3)]);
        store.store_snapshot("app-1", "env-1", ApplicationKind::Kubernetes, vec![resource("a", 3)]);
        assert_eq!(events.len(), 1);

        store.store_snapshot("app-1", "env-1", ApplicationKind::Kubernetes, vec![resource("a", 5)]);
        assert_eq!(events.len(), 2);

        let getter = store.getter();
        assert_eq!(getter.get("app-1").unwrap().version, 2);
        assert!(getter.get("other").is_none());
    }
}

//! Event store

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::apiclient::PipedService;
use crate::errors::PipedError;
use crate::model::Event;

/// Periodically refreshed cache of control-plane events.
pub struct EventStore {
    api: Arc<dyn PipedService>,
    snapshot: RwLock<Arc<HashMap<String, Event>>>,
    sync_interval: Duration,
}

impl EventStore {
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
        info!("Event store starting...");
        self.refresh().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Event store shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.sync_interval) => {}
            }
            self.refresh().await;
        }
    }

    /// Run one refresh pass immediately.
    pub async fn refresh(&self) {
        match self.api.list_events().await {
            Ok(events) => {
                debug!("Refreshed {} events", events.len());
                let map: HashMap<String, Event> =
                    events.into_iter().map(|e| (e.id.clone(), e)).collect();
                let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                *snapshot = Arc::new(map);
            }
            Err(e) => {
                error!("Failed to refresh event list: {}", e);
            }
        }
    }

    fn snapshot(&self) -> Arc<HashMap<String, Event>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Read-only access to cached events.
#[derive(Clone)]
pub struct EventGetter {
    store: Arc<EventStore>,
}

impl EventGetter {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    /// The most recent cached event matching name and labels.
    pub fn latest(&self, name: &str, labels: &HashMap<String, String>) -> Option<Event> {
        self.store
            .snapshot()
            .values()
            .filter(|e| e.name == name && e.matches_labels(labels))
            .max_by_key(|e| e.created_at)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiclient::FakeApiClient;
    use chrono::Utc;

    fn event(id: &str, name: &str, env: &str, age_secs: i64) -> Event {
        let mut labels = HashMap::new();
        labels.insert("env".to_string(), env.to_string());
        Event {
            id: id.to_string(),
            name: name.to_string(),
            data: String::new(),
            labels,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_latest_matches_name_and_labels() {
        let api = Arc::new(FakeApiClient::new());
        api.push_event(event("e1", "image-pushed", "staging", 60));
        api.push_event(event("e2", "image-pushed", "staging", 10));
        api.push_event(event("e3", "image-pushed", "production", 5));

        let store = Arc::new(EventStore::new(api, Duration::from_secs(30)));
        store.refresh().await;
        let getter = EventGetter::new(store);

        let mut labels = HashMap::new();
        labels.insert("env".to_string(), "staging".to_string());
        let latest = getter.latest("image-pushed", &labels).unwrap();
        assert_eq!(latest.id, "e2");

        assert!(getter.latest("chart-pushed", &labels).is_none());
    }
}

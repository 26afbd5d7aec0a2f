//! Environment store

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::apiclient::PipedService;
use crate::cache::TtlCache;
use crate::errors::PipedError;
use crate::model::Environment;

/// Default TTL for cached environments.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
/// How often the TTL cache sweeps expired entries.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Pull-through cache over GetEnvironment.
pub struct EnvironmentStore {
    api: Arc<dyn PipedService>,
    cache: TtlCache<Environment>,
}

impl EnvironmentStore {
    pub fn new(api: Arc<dyn PipedService>, ttl: Duration) -> Self {
        Self {
            api,
            cache: TtlCache::new(ttl),
        }
    }

    /// Get an environment, hitting the API only on a cache miss.
    pub async fn get(&self, id: &str) -> Result<Environment, PipedError> {
        if let Some(env) = self.cache.get(id) {
            return Ok(env);
        }
        debug!("Environment {} not cached, fetching", id);
        let env = self.api.get_environment(id).await?;
        self.cache.put(id, env.clone());
        Ok(env)
    }

    /// The TTL cache for the purge loop run by the supervisor.
    pub fn cache(&self) -> &TtlCache<Environment> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiclient::FakeApiClient;

    #[tokio::test]
    async fn test_pull_through() {
        let api = Arc::new(FakeApiClient::new());
        api.put_environment(Environment {
            id: "env-1".to_string(),
            name: "staging".to_string(),
            desc: String::new(),
        });

        let store = EnvironmentStore::new(api, DEFAULT_TTL);
        let env = store.get("env-1").await.unwrap();
        assert_eq!(env.name, "staging");

        // Unknown ids surface the typed sentinel.
        let err = store.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}

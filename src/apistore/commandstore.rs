//! Command store

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::apiclient::PipedService;
use crate::errors::PipedError;
use crate::model::{Command, CommandKind};

/// Periodically refreshed cache of unhandled commands, with at-most-once
/// acknowledgement back to the control plane.
pub struct CommandStore {
    api: Arc<dyn PipedService>,
    snapshot: RwLock<Arc<HashMap<String, Command>>>,
    /// Ids acknowledged locally; filtered out of the snapshot until the
    /// control plane catches up.
    handled: RwLock<HashSet<String>>,
    sync_interval: Duration,
}

impl CommandStore {
    pub fn new(api: Arc<dyn PipedService>, sync_interval: Duration) -> Self {
        Self {
            api,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            handled: RwLock::new(HashSet::new()),
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
        info!("Command store starting...");
        self.refresh().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Command store shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.sync_interval) => {}
            }
            self.refresh().await;
        }
    }

    /// Run one refresh pass immediately.
    pub async fn refresh(&self) {
        match self.api.list_unhandled_commands().await {
            Ok(commands) => {
                debug!("Refreshed {} commands", commands.len());
                let handled = self.handled.read().unwrap_or_else(|e| e.into_inner());
                let map: HashMap<String, Command> = commands
                    .into_iter()
                    .filter(|c| !handled.contains(&c.id))
                    .map(|c| (c.id.clone(), c))
                    .collect();
                drop(handled);
                let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                *snapshot = Arc::new(map);
            }
            Err(e) => {
                error!("Failed to refresh command list: {}", e);
            }
        }
    }

    fn snapshot(&self) -> Arc<HashMap<String, Command>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Acknowledge a command. The report is sent at most once per id even
    /// when callers race; a failed report is retried implicitly because the
    /// id is only recorded after success.
    pub async fn mark_handled(&self, command_id: &str) -> Result<(), PipedError> {
        {
            let handled = self.handled.read().unwrap_or_else(|e| e.into_inner());
            if handled.contains(command_id) {
                return Ok(());
            }
        }
        self.api.report_command_handled(command_id).await?;
        let mut handled = self.handled.write().unwrap_or_else(|e| e.into_inner());
        handled.insert(command_id.to_string());
        Ok(())
    }
}

/// Read-only snapshot access to the command store.
#[derive(Clone)]
pub struct CommandLister {
    store: Arc<CommandStore>,
}

impl CommandLister {
    pub fn new(store: Arc<CommandStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Vec<Command> {
        self.store.snapshot().values().cloned().collect()
    }

    pub fn list_application_commands(&self, application_id: &str) -> Vec<Command> {
        self.store
            .snapshot()
            .values()
            .filter(|c| c.application_id == application_id)
            .cloned()
            .collect()
    }

    pub fn list_deployment_commands(&self, deployment_id: &str) -> Vec<Command> {
        self.store
            .snapshot()
            .values()
            .filter(|c| c.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    /// Pending sync requests, drained by the trigger.
    pub fn list_sync_commands(&self) -> Vec<Command> {
        self.store
            .snapshot()
            .values()
            .filter(|c| c.kind == CommandKind::SyncApplication)
            .cloned()
            .collect()
    }

    /// Acknowledge through the owning store.
    pub async fn mark_handled(&self, command_id: &str) -> Result<(), PipedError> {
        self.store.mark_handled(command_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiclient::{FakeApiClient, RecordedCall};
    use chrono::Utc;

    fn command(id: &str) -> Command {
        Command {
            id: id.to_string(),
            kind: CommandKind::SyncApplication,
            commander: "alice".to_string(),
            application_id: "app-1".to_string(),
            deployment_id: String::new(),
            stage_id: String::new(),
            force_rollback: false,
            force_no_rollback: false,
            handled: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_mark_handled_is_at_most_once() {
        let api = Arc::new(FakeApiClient::new());
        api.push_command(command("cmd-1"));

        let store = CommandStore::new(api.clone(), Duration::from_secs(30));
        store.refresh().await;

        store.mark_handled("cmd-1").await.unwrap();
        store.mark_handled("cmd-1").await.unwrap();

        let acks = api
            .calls()
            .iter()
            .filter(|c| matches!(c, RecordedCall::CommandHandled { .. }))
            .count();
        assert_eq!(acks, 1);
    }

    #[tokio::test]
    async fn test_handled_commands_filtered_from_snapshot() {
        let api = Arc::new(FakeApiClient::new());
        api.push_command(command("cmd-1"));
        api.push_command(command("cmd-2"));

        let store = Arc::new(CommandStore::new(api, Duration::from_secs(30)));
        store.refresh().await;
        store.mark_handled("cmd-1").await.unwrap();
        store.refresh().await;

        let lister = CommandLister::new(store);
        let ids: Vec<String> = lister.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["cmd-2".to_string()]);
    }
}

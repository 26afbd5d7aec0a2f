//! Drift detector
//!
//! Periodically compares the desired manifests at the branch head against
//! the live snapshot and derives a sync state per application. Reporting
//! is level-triggered: re-detecting an unchanged world emits nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::apiclient::PipedService;
use crate::apistore::{ApplicationLister, DeploymentLister};
use crate::cloudprovider::{DiffRecord, Manifest, ProviderRegistry};
use crate::config::{Config, PipedSpec};
use crate::errors::PipedError;
use crate::git::GitClient;
use crate::livestatestore::LiveStateGetter;
use crate::model::{Application, ApplicationSyncState, SyncStatus};
use crate::notifier::{NotificationEvent, Notifier};

/// Default interval between detection passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub struct DriftDetector {
    api: Arc<dyn PipedService>,
    git: Arc<GitClient>,
    app_lister: ApplicationLister,
    deployment_lister: DeploymentLister,
    live_getter: LiveStateGetter,
    providers: Arc<ProviderRegistry>,
    notifier: Arc<Notifier>,
    config: Arc<PipedSpec>,
    /// Last reported state per application, for edge suppression
    last_reported: Mutex<HashMap<String, ApplicationSyncState>>,
    interval: Duration,
}

impl DriftDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn PipedService>,
        git: Arc<GitClient>,
        app_lister: ApplicationLister,
        deployment_lister: DeploymentLister,
        live_getter: LiveStateGetter,
        providers: Arc<ProviderRegistry>,
        notifier: Arc<Notifier>,
        config: Arc<PipedSpec>,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            git,
            app_lister,
            deployment_lister,
            live_getter,
            providers,
            notifier,
            config,
            last_reported: Mutex::new(HashMap::new()),
            interval,
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
        info!("Drift detector starting...");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Drift detector shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.interval) => {}
            }
            self.detect_all().await;
        }
    }

    /// One detection pass over every application.
    pub async fn detect_all(&self) {
        for repo_cfg in &self.config.repositories {
            let repo = match self
                .git
                .prepare_repo(&repo_cfg.repo_id, &repo_cfg.remote, &repo_cfg.branch)
                .await
            {
                Ok(repo) => repo,
                Err(e) => {
                    error!("Failed to prepare repository {}: {}", repo_cfg.repo_id, e);
                    continue;
                }
            };
            {
                let _guard = repo.lock().await;
                if let Err(e) = repo.pull().await {
                    error!("Failed to refresh repository {}: {}", repo_cfg.repo_id, e);
                    continue;
                }
            }

            for app in self.app_lister.list_by_repo(&repo_cfg.repo_id) {
                if app.disabled {
                    continue;
                }
                let state = self.detect(&repo, &app).await;
                self.report_if_changed(&app, state).await;
            }
        }
    }

    async fn detect(&self, repo: &Arc<crate::git::Repo>, app: &Application) -> ApplicationSyncState {
        let head_deployment_id = self.head_deployment_id(&app.id);

        // An in-progress deployment owns the divergence.
        if self.deployment_lister.has_in_progress(&app.id) {
            return state(SyncStatus::Deploying, "", "", &head_deployment_id);
        }

        let desired = match self.load_desired(repo, app).await {
            Ok(desired) => desired,
            Err(e) => {
                return state(
                    SyncStatus::InvalidConfig,
                    "invalid configuration",
                    &e.to_string(),
                    &head_deployment_id,
                );
            }
        };

        let Some(live) = self.live_getter.get(&app.id) else {
            return state(SyncStatus::Unknown, "", "", &head_deployment_id);
        };

        for manifest in &desired {
            let Some(live_manifest) = live.resources.iter().find(|m| m.key == manifest.key) else {
                let short = format!("resource {} is missing", manifest.key.name);
                return state(
                    SyncStatus::OutOfSync,
                    &short,
                    &format!("{} is declared in Git but not running", manifest.key),
                    &head_deployment_id,
                );
            };
            let diffs = desired_diff(manifest, live_manifest);
            if let Some(first) = diffs.first() {
                let short = format!("resource {} is out of sync", manifest.key.name);
                let reason = format!(
                    "{}: {} is {:?} in Git but {:?} live",
                    manifest.key, first.path, first.after, first.before
                );
                return state(SyncStatus::OutOfSync, &short, &reason, &head_deployment_id);
            }
        }

        state(SyncStatus::Synced, "", "", &head_deployment_id)
    }

    async fn load_desired(
        &self,
        repo: &Arc<crate::git::Repo>,
        app: &Application,
    ) -> Result<Vec<Manifest>, PipedError> {
        let provider = self.providers.get(&app.cloud_provider).ok_or_else(|| {
            PipedError::ConfigError(format!("unknown cloud provider {}", app.cloud_provider))
        })?;

        let _guard = repo.lock().await;
        let app_dir = repo.dir().join(&app.git_path.path);
        let app_spec = Config::load_from_file(app_dir.join(app.git_path.config_file()))
            .await
            .and_then(Config::app_spec)?;
        provider.load_manifests(&app_dir, &app_spec).await
    }

    fn head_deployment_id(&self, app_id: &str) -> String {
        self.deployment_lister
            .list()
            .into_iter()
            .filter(|d| d.application_id == app_id)
            .max_by_key(|d| d.created_at)
            .map(|d| d.id)
            .unwrap_or_default()
    }

    /// Report only on change, so an unchanged world emits zero events
    /// after the first.
    async fn report_if_changed(&self, app: &Application, current: ApplicationSyncState) {
        {
            let last = self.last_reported.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = last.get(&app.id) {
                if previous.same_as(&current) {
                    return;
                }
            }
        }

        debug!("Sync state of {} changed to {:?}", app.id, current.status);
        metrics::counter!("piped_drift_reports_total").increment(1);
        if let Err(e) = self
            .api
            .report_application_sync_state(&app.id, current.clone())
            .await
        {
            // Not recorded as reported, so the next pass retries.
            error!("Failed to report sync state of {}: {}", app.id, e);
            return;
        }

        if current.status == SyncStatus::OutOfSync {
            self.notifier.notify(NotificationEvent::ApplicationOutOfSync {
                application_id: app.id.clone(),
                env_id: app.env_id.clone(),
                reason: current.short_reason.clone(),
            });
        }

        let mut last = self.last_reported.lock().unwrap_or_else(|e| e.into_inner());
        last.insert(app.id.clone(), current);
    }
}

fn state(
    status: SyncStatus,
    short_reason: &str,
    reason: &str,
    head_deployment_id: &str,
) -> ApplicationSyncState {
    ApplicationSyncState {
        status,
        short_reason: short_reason.to_string(),
        reason: reason.to_string(),
        head_deployment_id: head_deployment_id.to_string(),
        timestamp: Utc::now(),
    }
}

/// Diff scoped to the fields Git declares: live-side extras (defaulted
/// fields, status) are ignored so they never read as drift.
pub fn desired_diff(desired: &Manifest, live: &Manifest) -> Vec<DiffRecord> {
    let desired_spec = desired.field("spec").cloned().unwrap_or(Value::Null);
    let live_spec = live.field("spec").cloned().unwrap_or(Value::Null);
    let mut records = Vec::new();
    walk_desired(&desired_spec, &live_spec, "spec", &mut records);
    records
}

fn walk_desired(desired: &Value, live: &Value, path: &str, records: &mut Vec<DiffRecord>) {
    match (desired, live) {
        (Value::Object(desired_map), Value::Object(live_map)) => {
            for (key, desired_child) in desired_map {
                let child_path = format!("{}.{}", path, key);
                walk_desired(
                    desired_child,
                    live_map.get(key).unwrap_or(&Value::Null),
                    &child_path,
                    records,
                );
            }
        }
        (Value::Array(desired_items), Value::Array(live_items)) => {
            for (i, desired_child) in desired_items.iter().enumerate() {
                let child_path = format!("{}.[{}]", path, i);
                walk_desired(
                    desired_child,
                    live_items.get(i).unwrap_or(&Value::Null),
                    &child_path,
                    records,
                );
            }
        }
        (desired, live) => {
            if desired != live {
                records.push(DiffRecord {
                    path: path.to_string(),
                    before: render(live),
                    after: render(desired),
                });
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::ResourceKey;

    fn manifest(value: Value) -> Manifest {
        Manifest::new(ResourceKey::new("apps", "Deployment", "default", "app"), value)
    }

    #[test]
    fn test_live_extras_are_not_drift() {
        let desired = manifest(serde_json::json!({
            "spec": {"replicas": 3}
        }));
        let live = manifest(serde_json::json!({
            "spec": {"replicas": 3, "progressDeadlineSeconds": 600},
            "status": {"readyReplicas": 3}
        }));
        assert!(desired_diff(&desired, &live).is_empty());
    }

    #[test]
    fn test_desired_change_is_drift() {
        let desired = manifest(serde_json::json!({
            "spec": {"replicas": 5}
        }));
        let live = manifest(serde_json::json!({
            "spec": {"replicas": 3}
        }));
        let records = desired_diff(&desired, &live);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "spec.replicas");
        assert_eq!(records[0].before, "3");
        assert_eq!(records[0].after, "5");
    }
}

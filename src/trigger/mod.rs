//! Deployment trigger
//!
//! Periodically walks the configured repositories and, for each enabled
//! application whose trigger paths changed between the last-seen head and
//! the current head, asks the control plane to create a deployment for the
//! new head. Exactly one create call is made per (application, head)
//! observation; a failing repository never blocks the others.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::apiclient::PipedService;
use crate::apistore::{ApplicationLister, CommandLister, DeploymentLister};
use crate::config::{Config, PipedSpec};
use crate::errors::PipedError;
use crate::git::{GitClient, Repo};
use crate::model::{
    Application, Commit, Deployment, DeploymentStatus, DeploymentTrigger,
};
use crate::notifier::{NotificationEvent, Notifier};
use crate::planner::matches_commit_pattern;

pub struct Trigger {
    api: Arc<dyn PipedService>,
    git: Arc<GitClient>,
    app_lister: ApplicationLister,
    deployment_lister: DeploymentLister,
    command_lister: CommandLister,
    notifier: Arc<Notifier>,
    config: Arc<PipedSpec>,
    /// Commit hash most recently triggered per application
    last_triggered: Mutex<HashMap<String, String>>,
    interval: Duration,
}

impl Trigger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn PipedService>,
        git: Arc<GitClient>,
        app_lister: ApplicationLister,
        deployment_lister: DeploymentLister,
        command_lister: CommandLister,
        notifier: Arc<Notifier>,
        config: Arc<PipedSpec>,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            git,
            app_lister,
            deployment_lister,
            command_lister,
            notifier,
            config,
            last_triggered: Mutex::new(HashMap::new()),
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
        info!("Trigger starting...");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Trigger shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.interval) => {}
            }
            self.check_commands().await;
            self.check_repositories().await;
        }
    }

    /// Serve on-demand sync requests regardless of changed paths.
    pub async fn check_commands(&self) {
        for command in self.command_lister.list_sync_commands() {
            let Some(app) = self.app_lister.get(&command.application_id) else {
                continue;
            };
            let Some(repo_cfg) = self.config.repository(&app.git_path.repo_id) else {
                warn!(
                    "Application {} references unregistered repository {}",
                    app.id, app.git_path.repo_id
                );
                continue;
            };

            let head = match self.repo_head(&repo_cfg.repo_id, &repo_cfg.remote, &repo_cfg.branch).await {
                Ok(head) => head,
                Err(e) => {
                    error!("Failed to resolve head of {}: {}", repo_cfg.repo_id, e);
                    continue;
                }
            };

            if let Err(e) = self.trigger_deployment(&app, head, &command.commander).await {
                error!("Failed to sync application {}: {}", app.id, e);
                continue;
            }
            if let Err(e) = self.command_lister.mark_handled(&command.id).await {
                warn!("Failed to acknowledge command {}: {}", command.id, e);
            }
        }
    }

    /// One pass over every registered repository.
    pub async fn check_repositories(&self) {
        for repo_cfg in &self.config.repositories {
            let (repo, head) = match self
                .prepare_head(&repo_cfg.repo_id, &repo_cfg.remote, &repo_cfg.branch)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    // One broken repository must not block the others.
                    error!("Failed to update repository {}: {}", repo_cfg.repo_id, e);
                    continue;
                }
            };

            for app in self.app_lister.list_by_repo(&repo_cfg.repo_id) {
                if app.disabled {
                    continue;
                }
                if !app.git_path.branch.is_empty() && app.git_path.branch != repo_cfg.branch {
                    continue;
                }
                if let Err(e) = self.check_application(&repo, &app, &head).await {
                    error!("Failed to check application {}: {}", app.id, e);
                }
            }
        }
    }

    async fn prepare_head(
        &self,
        repo_id: &str,
        remote: &str,
        branch: &str,
    ) -> Result<(Arc<Repo>, Commit), PipedError> {
        let repo = self.git.prepare_repo(repo_id, remote, branch).await?;
        let head = {
            let _guard = repo.lock().await;
            repo.pull().await?;
            repo.head_commit().await?
        };
        Ok((repo, head))
    }

    async fn repo_head(
        &self,
        repo_id: &str,
        remote: &str,
        branch: &str,
    ) -> Result<Commit, PipedError> {
        let (_, head) = self.prepare_head(repo_id, remote, branch).await?;
        Ok(head)
    }

    async fn check_application(
        &self,
        repo: &Arc<Repo>,
        app: &Application,
        head: &Commit,
    ) -> Result<(), PipedError> {
        // Idempotency: one deployment per (application, head).
        if self.deployment_lister.exists_for_commit(&app.id, &head.hash) {
            return Ok(());
        }
        {
            let last = self.last_triggered.lock().unwrap_or_else(|e| e.into_inner());
            if last.get(&app.id) == Some(&head.hash) {
                return Ok(());
            }
        }

        let last_hash = app.most_recent_successful_commit_hash.clone();
        if last_hash.is_empty() {
            // Nothing deployed yet; any observed head is worth a deployment.
            return self.trigger_deployment(app, head.clone(), "").await;
        }
        if last_hash == head.hash {
            return Ok(());
        }

        if !self.should_trigger(repo, app, &last_hash, head).await? {
            debug!("No trigger-path change for {} between {} and {}", app.id, last_hash, head.hash);
            return Ok(());
        }
        self.trigger_deployment(app, head.clone(), "").await
    }

    async fn should_trigger(
        &self,
        repo: &Arc<Repo>,
        app: &Application,
        last_hash: &str,
        head: &Commit,
    ) -> Result<bool, PipedError> {
        let (matcher, trigger_paths) = {
            let _guard = repo.lock().await;
            let config_path = repo
                .dir()
                .join(&app.git_path.path)
                .join(app.git_path.config_file());
            match Config::load_from_file(&config_path).await.and_then(Config::app_spec) {
                Ok(spec) => (
                    Some(spec.generic().commit_matcher.clone()),
                    spec.generic().trigger_paths.clone(),
                ),
                Err(_) => (None, Vec::new()),
            }
        };

        // Commit-message forcing overrides trigger-path evaluation.
        if let Some(matcher) = &matcher {
            if matches_commit_pattern(&matcher.quick_sync, &head.message)
                || matches_commit_pattern(&matcher.pipeline, &head.message)
            {
                return Ok(true);
            }
        }

        let changed = repo.changed_files(last_hash, &head.hash).await?;
        let app_prefix = app.git_path.path.trim_end_matches('/');

        let touched = changed.iter().any(|file| {
            if !app_prefix.is_empty() && file.starts_with(app_prefix) {
                return true;
            }
            trigger_paths.iter().any(|p| {
                regex::Regex::new(p)
                    .map(|re| re.is_match(file))
                    .unwrap_or(false)
            })
        });
        Ok(touched)
    }

    async fn trigger_deployment(
        &self,
        app: &Application,
        commit: Commit,
        commander: &str,
    ) -> Result<(), PipedError> {
        let now = Utc::now();
        let deployment = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            application_id: app.id.clone(),
            application_name: app.name.clone(),
            env_id: app.env_id.clone(),
            kind: app.kind,
            cloud_provider: app.cloud_provider.clone(),
            trigger: DeploymentTrigger {
                commit: commit.clone(),
                commander: commander.to_string(),
                timestamp: Some(now),
            },
            status: DeploymentStatus::Pending,
            status_reason: String::new(),
            stages: Vec::new(),
            running_commit_hash: String::new(),
            summary: String::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        info!(
            "Triggering deployment of {} at commit {}",
            app.id, commit.hash
        );
        self.api.create_deployment(deployment.clone()).await?;
        metrics::counter!("piped_deployments_triggered_total").increment(1);

        {
            let mut last = self.last_triggered.lock().unwrap_or_else(|e| e.into_inner());
            last.insert(app.id.clone(), commit.hash);
        }
        self.notifier.notify(NotificationEvent::DeploymentTriggered {
            deployment: Box::new(deployment),
        });
        Ok(())
    }
}

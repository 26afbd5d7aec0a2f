//! Deployment controller
//!
//! Watches the deployment store, plans PENDING deployments exactly once,
//! and drives PLANNED deployments through per-deployment schedulers. At
//! most one deployment per application is in flight; newer deployments for
//! the same application queue behind the running one in creation order.
//! Cancel commands are routed to the stop signal of the active scheduler.

pub mod scheduler;

pub use scheduler::Scheduler;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::apiclient::PipedService;
use crate::apistore::{ApplicationLister, CommandLister, DeploymentLister};
use crate::cache::SingleflightCache;
use crate::cloudprovider::{Manifest, ProviderRegistry};
use crate::config::{AppDeploymentSpec, Config, PipedSpec};
use crate::errors::PipedError;
use crate::executor::{ExecutorRegistry, StopSignal, StopSignalHandler, StopSignalKind};
use crate::git::GitClient;
use crate::model::{
    Application, Command, CommandKind, Deployment, DeploymentStatus,
};
use crate::notifier::{NotificationEvent, Notifier};
use crate::planner::{PlannerInput, PlannerRegistry};
use crate::sealedsecret::{decrypt_into_deploy_source, Decrypter};

/// How often the controller checks for new work.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

struct InFlight {
    deployment_id: String,
    handler: Arc<StopSignalHandler>,
    handle: JoinHandle<DeploymentStatus>,
}

/// A prepared deploy source: the application directory checked out at the
/// target commit (and the running commit when known), secrets decrypted,
/// configuration loaded.
pub(crate) struct DeploySource {
    pub target_dir: PathBuf,
    pub running_dir: Option<PathBuf>,
    pub app_spec: Arc<AppDeploymentSpec>,
}

pub struct Controller {
    api: Arc<dyn PipedService>,
    git: Arc<GitClient>,
    app_lister: ApplicationLister,
    deployment_lister: DeploymentLister,
    command_lister: CommandLister,
    planners: Arc<PlannerRegistry>,
    executors: Arc<ExecutorRegistry>,
    providers: Arc<ProviderRegistry>,
    notifier: Arc<Notifier>,
    decrypter: Option<Arc<dyn Decrypter>>,
    config: Arc<PipedSpec>,
    manifests_cache: Arc<SingleflightCache<Vec<Manifest>>>,
    workspace_dir: PathBuf,

    in_flight: Mutex<HashMap<String, InFlight>>,
    /// Deployments planned locally, ready to schedule before the store
    /// snapshot catches up
    planned_ready: Mutex<HashMap<String, Deployment>>,
    /// Ids this process already planned or scheduled
    seen: Mutex<HashSet<String>>,
    /// Ids handed to a scheduler, so a stale store snapshot cannot start
    /// the same deployment twice
    scheduled: Mutex<HashSet<String>>,

    interval: Duration,
    scheduler_tick: Duration,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn PipedService>,
        git: Arc<GitClient>,
        app_lister: ApplicationLister,
        deployment_lister: DeploymentLister,
        command_lister: CommandLister,
        planners: Arc<PlannerRegistry>,
        executors: Arc<ExecutorRegistry>,
        providers: Arc<ProviderRegistry>,
        notifier: Arc<Notifier>,
        decrypter: Option<Arc<dyn Decrypter>>,
        config: Arc<PipedSpec>,
        manifests_cache: Arc<SingleflightCache<Vec<Manifest>>>,
        workspace_dir: PathBuf,
    ) -> Self {
        Self {
            api,
            git,
            app_lister,
            deployment_lister,
            command_lister,
            planners,
            executors,
            providers,
            notifier,
            decrypter,
            config,
            manifests_cache,
            workspace_dir,
            in_flight: Mutex::new(HashMap::new()),
            planned_ready: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            scheduled: Mutex::new(HashSet::new()),
            interval: DEFAULT_SYNC_INTERVAL,
            scheduler_tick: scheduler::DEFAULT_TICK,
        }
    }

    /// Override the polling cadence, used by tests.
    pub fn with_intervals(mut self, interval: Duration, scheduler_tick: Duration) -> Self {
        self.interval = interval;
        self.scheduler_tick = scheduler_tick;
        self
    }

    pub async fn run<S, F>(
        &self,
        grace_period: Duration,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), PipedError>
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!("Controller starting...");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Controller shutting down...");
                    self.shutdown_in_flight(grace_period).await;
                    return Ok(());
                }
                _ = sleep_fn(self.interval) => {}
            }
            self.sync_once().await;
        }
    }

    /// One controller pass: reap, route commands, plan, schedule.
    pub async fn sync_once(&self) {
        self.reap_finished();
        self.route_cancel_commands().await;
        self.plan_pending_deployments().await;
        self.start_planned_deployments().await;
    }

    fn reap_finished(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|app_id, entry| {
            if entry.handle.is_finished() {
                debug!(
                    "Deployment {} of {} left the in-flight set",
                    entry.deployment_id, app_id
                );
                false
            } else {
                true
            }
        });
    }

    async fn route_cancel_commands(&self) {
        let commands: Vec<Command> = self
            .command_lister
            .list()
            .into_iter()
            .filter(|c| c.kind == CommandKind::CancelDeployment)
            .collect();

        for command in commands {
            let routed = {
                let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight
                    .values()
                    .find(|e| e.deployment_id == command.deployment_id)
                    .map(|e| e.handler.clone())
            };

            if let Some(handler) = routed {
                let kind = if command.force_rollback {
                    StopSignalKind::CancelWithRollback
                } else if command.force_no_rollback {
                    StopSignalKind::CancelWithoutRollback
                } else {
                    StopSignalKind::Cancel
                };
                info!(
                    "Cancelling deployment {} ({:?})",
                    command.deployment_id, kind
                );
                handler.cancel(kind);
            } else if let Some(deployment) =
                self.take_waiting_deployment(&command.deployment_id)
            {
                // Not started yet: complete it as cancelled directly.
                let _ = self
                    .api
                    .report_deployment_completed(
                        &deployment.id,
                        DeploymentStatus::Cancelled,
                        "cancelled",
                        HashMap::new(),
                    )
                    .await;
                self.notifier.notify(NotificationEvent::DeploymentCancelled {
                    deployment: Box::new(deployment),
                    commander: command.commander.clone(),
                });
            } else {
                // Unknown deployment; acknowledge and move on.
                debug!(
                    "CancelDeployment for unknown deployment {}",
                    command.deployment_id
                );
            }

            if let Err(e) = self.command_lister.mark_handled(&command.id).await {
                warn!("Failed to acknowledge command {}: {}", command.id, e);
            }
        }
    }

    fn take_waiting_deployment(&self, deployment_id: &str) -> Option<Deployment> {
        let mut planned = self.planned_ready.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(d) = planned.remove(deployment_id) {
            return Some(d);
        }
        drop(planned);
        self.deployment_lister
            .get(deployment_id)
            .filter(|d| !d.status.is_completed())
    }

    async fn plan_pending_deployments(&self) {
        for deployment in self.deployment_lister.list_pendings() {
            {
                let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
                if seen.contains(&deployment.id) {
                    continue;
                }
            }
            self.seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(deployment.id.clone());

            if let Err(e) = self.plan_deployment(deployment.clone()).await {
                error!("Failed to plan deployment {}: {}", deployment.id, e);
                // Configuration and planning errors surface to the user
                // through the deployment's status reason.
                let _ = self
                    .api
                    .report_deployment_completed(
                        &deployment.id,
                        DeploymentStatus::Failure,
                        &e.to_string(),
                        HashMap::new(),
                    )
                    .await;
            }
        }
    }

    async fn plan_deployment(&self, mut deployment: Deployment) -> Result<(), PipedError> {
        let app = self
            .app_lister
            .get(&deployment.application_id)
            .ok_or_else(|| {
                PipedError::NotFound(format!(
                    "application {} is not cached",
                    deployment.application_id
                ))
            })?;
        let provider = self
            .providers
            .get(&app.cloud_provider)
            .ok_or_else(|| {
                PipedError::ConfigError(format!("unknown cloud provider {}", app.cloud_provider))
            })?;
        let planner = self
            .planners
            .get(app.kind)
            .ok_or_else(|| scheduler::unsupported_kind_error(&deployment))?;

        let source = self.prepare_deploy_source(&deployment, &app).await?;

        let new_manifests = provider
            .load_manifests(&source.target_dir, &source.app_spec)
            .await
            .map_err(|e| PipedError::PlanError(format!("failed to load new manifests: {}", e)))?;
        let old_manifests = match &source.running_dir {
            Some(dir) => provider
                .load_manifests(dir, &source.app_spec)
                .await
                .map_err(|e| {
                    PipedError::PlanError(format!(
                        "failed to load previously deployed manifests: {}",
                        e
                    ))
                })?,
            None => Vec::new(),
        };

        let input = PlannerInput {
            deployment: deployment.clone(),
            application: app.clone(),
            app_spec: (*source.app_spec).clone(),
            most_recent_successful_commit_hash: app.most_recent_successful_commit_hash.clone(),
            old_manifests,
            new_manifests,
        };
        let plan = planner.plan(&input)?;

        info!(
            "Planned deployment {}: {} ({} stages)",
            deployment.id,
            plan.summary,
            plan.stages.len()
        );
        self.api
            .report_deployment_planned(
                &deployment.id,
                &plan.summary,
                plan.stages.clone(),
                &app.most_recent_successful_commit_hash,
            )
            .await?;

        deployment.status = DeploymentStatus::Planned;
        deployment.summary = plan.summary.clone();
        deployment.stages = plan.stages;
        deployment.running_commit_hash = app.most_recent_successful_commit_hash.clone();

        self.notifier.notify(NotificationEvent::DeploymentPlanned {
            deployment: Box::new(deployment.clone()),
        });
        let mut planned = self.planned_ready.lock().unwrap_or_else(|e| e.into_inner());
        planned.insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn start_planned_deployments(&self) {
        // Locally planned deployments plus store-visible ones (the latter
        // covers resuming after an agent restart).
        let mut candidates: HashMap<String, Deployment> = HashMap::new();
        {
            let scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner());
            for deployment in self.deployment_lister.list() {
                let schedulable = matches!(
                    deployment.status,
                    DeploymentStatus::Planned
                        | DeploymentStatus::Running
                        | DeploymentStatus::RollingBack
                );
                if schedulable
                    && !deployment.stages.is_empty()
                    && !scheduled.contains(&deployment.id)
                {
                    candidates.insert(deployment.id.clone(), deployment);
                }
            }
        }
        {
            let planned = self.planned_ready.lock().unwrap_or_else(|e| e.into_inner());
            for (id, deployment) in planned.iter() {
                candidates.insert(id.clone(), deployment.clone());
            }
        }

        // Per application, earliest first; one in flight at a time.
        let mut by_app: HashMap<String, Vec<Deployment>> = HashMap::new();
        for deployment in candidates.into_values() {
            by_app
                .entry(deployment.application_id.clone())
                .or_default()
                .push(deployment);
        }

        for (app_id, mut deployments) in by_app {
            {
                let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if in_flight.contains_key(&app_id) {
                    continue;
                }
            }
            deployments.sort_by_key(|d| d.created_at);
            let deployment = deployments.remove(0);
            if let Err(e) = self.start_scheduler(deployment).await {
                error!("Failed to start a scheduler for {}: {}", app_id, e);
            }
        }
    }

    async fn start_scheduler(&self, deployment: Deployment) -> Result<(), PipedError> {
        let app = self
            .app_lister
            .get(&deployment.application_id)
            .ok_or_else(|| {
                PipedError::NotFound(format!(
                    "application {} is not cached",
                    deployment.application_id
                ))
            })?;
        let provider = self
            .providers
            .get(&app.cloud_provider)
            .ok_or_else(|| {
                PipedError::ConfigError(format!("unknown cloud provider {}", app.cloud_provider))
            })?;

        let source = self.prepare_deploy_source(&deployment, &app).await?;
        let (handler, sig) = StopSignal::new();

        let scheduler = Scheduler::new(
            self.api.clone(),
            self.executors.clone(),
            provider,
            self.command_lister.clone(),
            self.manifests_cache.clone(),
            self.notifier.clone(),
            deployment.clone(),
            app,
            source.app_spec,
            source.target_dir,
            source.running_dir,
            sig,
            self.scheduler_tick,
        );
        let handle = tokio::spawn(scheduler.run());

        self.planned_ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&deployment.id);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(deployment.id.clone());
        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(deployment.id.clone());
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.insert(
            deployment.application_id.clone(),
            InFlight {
                deployment_id: deployment.id.clone(),
                handler: Arc::new(handler),
                handle,
            },
        );
        Ok(())
    }

    /// Check out the deployment's commits into its own workspace, decrypt
    /// sealed secrets and load the validated configuration.
    pub(crate) async fn prepare_deploy_source(
        &self,
        deployment: &Deployment,
        app: &Application,
    ) -> Result<DeploySource, PipedError> {
        let repo_cfg = self.config.repository(&app.git_path.repo_id).ok_or_else(|| {
            PipedError::ConfigError(format!(
                "application {} references unregistered repository {}",
                app.id, app.git_path.repo_id
            ))
        })?;
        let repo = self
            .git
            .prepare_repo(&repo_cfg.repo_id, &repo_cfg.remote, &repo_cfg.branch)
            .await?;

        let base = self.workspace_dir.join(&deployment.id);
        let target_dir = base.join("target");
        let running_path = base.join("running");

        let running_hash = if !deployment.running_commit_hash.is_empty() {
            deployment.running_commit_hash.clone()
        } else {
            app.most_recent_successful_commit_hash.clone()
        };

        let mut running_dir = None;
        {
            // Checkout mutates the shared working tree in place.
            let _guard = repo.lock().await;
            if let Err(e) = repo.pull().await {
                warn!("Failed to refresh repo {}: {}", repo.id, e);
            }

            repo.checkout(&deployment.trigger.commit.hash).await?;
            copy_dir(&repo.dir().join(&app.git_path.path), &target_dir).await?;

            if !running_hash.is_empty() {
                match repo.checkout(&running_hash).await {
                    Ok(()) => {
                        copy_dir(&repo.dir().join(&app.git_path.path), &running_path).await?;
                        running_dir = Some(running_path);
                    }
                    Err(e) => {
                        warn!("Unable to check out running commit {}: {}", running_hash, e);
                    }
                }
            }
        }

        let config_path = target_dir.join(app.git_path.config_file());
        let app_spec = Config::load_from_file(&config_path)
            .await
            .and_then(Config::app_spec)
            .map_err(|e| {
                PipedError::ConfigError(format!(
                    "failed to load deployment configuration: {}",
                    e
                ))
            })?;

        if let Some(decrypter) = &self.decrypter {
            let mappings = &app_spec.generic().sealed_secrets;
            decrypt_into_deploy_source(decrypter.as_ref(), mappings, &target_dir).await?;
            if let Some(dir) = &running_dir {
                decrypt_into_deploy_source(decrypter.as_ref(), mappings, dir).await?;
            }
        }

        Ok(DeploySource {
            target_dir,
            running_dir,
            app_spec: Arc::new(app_spec),
        })
    }

    async fn shutdown_in_flight(&self, grace_period: Duration) {
        let entries: Vec<(String, Arc<StopSignalHandler>, JoinHandle<DeploymentStatus>)> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight
                .drain()
                .map(|(app, e)| (app, e.handler, e.handle))
                .collect()
        };
        if entries.is_empty() {
            return;
        }

        info!("Terminating {} in-flight deployments", entries.len());
        for (_, handler, _) in &entries {
            handler.terminate();
        }
        for (app_id, _, handle) in entries {
            match tokio::time::timeout(grace_period, handle).await {
                Ok(_) => {}
                Err(_) => warn!("Scheduler of {} did not stop within the grace period", app_id),
            }
        }
    }
}

/// Recursively copy a directory, used to snapshot the application
/// directory out of the mutable git working tree.
pub(crate) async fn copy_dir(from: &Path, to: &Path) -> Result<(), PipedError> {
    if !from.is_dir() {
        return Err(PipedError::DeployError(format!(
            "application directory {} does not exist",
            from.display()
        )));
    }
    tokio::fs::create_dir_all(to).await?;

    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            if path.is_dir() {
                if name == ".git" {
                    continue;
                }
                let child = dst.join(&name);
                tokio::fs::create_dir_all(&child).await?;
                pending.push((path, child));
            } else {
                tokio::fs::copy(&path, dst.join(&name)).await?;
            }
        }
    }
    Ok(())
}

//! Per-deployment scheduler
//!
//! Drives one deployment through its stage state machine: a stage becomes
//! eligible when all its predecessors are SUCCESS, stages run one at a
//! time, transitions are persisted monotonically, and a cancel signal or
//! stage failure routes execution into the rollback stage before the
//! deployment is completed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::apiclient::PipedService;
use crate::apistore::CommandLister;
use crate::cache::SingleflightCache;
use crate::cloudprovider::{CloudProvider, Manifest};
use crate::config::{AppDeploymentSpec, PipelineStage};
use crate::errors::PipedError;
use crate::executor::{
    determine_stage_status, ExecutorInput, ExecutorRegistry, MetadataStore, StageLogPersister,
    StageResult, StopSignal, StopSignalKind,
};
use crate::model::{Application, Deployment, DeploymentStatus, StageName, StageStatus};
use crate::notifier::{NotificationEvent, Notifier};

/// Default delay between executor ticks for stages that return Exited.
pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(6 * 3600);

pub struct Scheduler {
    api: Arc<dyn PipedService>,
    executors: Arc<ExecutorRegistry>,
    provider: Arc<dyn CloudProvider>,
    command_lister: CommandLister,
    manifests_cache: Arc<SingleflightCache<Vec<Manifest>>>,
    notifier: Arc<Notifier>,
    deployment: Deployment,
    application: Application,
    app_spec: Arc<AppDeploymentSpec>,
    target_dir: PathBuf,
    running_dir: Option<PathBuf>,
    metadata: Arc<MetadataStore>,
    sig: StopSignal,
    tick: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn PipedService>,
        executors: Arc<ExecutorRegistry>,
        provider: Arc<dyn CloudProvider>,
        command_lister: CommandLister,
        manifests_cache: Arc<SingleflightCache<Vec<Manifest>>>,
        notifier: Arc<Notifier>,
        deployment: Deployment,
        application: Application,
        app_spec: Arc<AppDeploymentSpec>,
        target_dir: PathBuf,
        running_dir: Option<PathBuf>,
        sig: StopSignal,
        tick: Duration,
    ) -> Self {
        let metadata = Arc::new(MetadataStore::new(api.clone(), &deployment.id));
        metadata.seed(deployment.metadata.clone());
        Self {
            api,
            executors,
            provider,
            command_lister,
            manifests_cache,
            notifier,
            deployment,
            application,
            app_spec,
            target_dir,
            running_dir,
            metadata,
            sig,
            tick,
        }
    }

    /// Drive the deployment to a terminal state. Returns early without a
    /// completion report when the agent is shutting down.
    pub async fn run(mut self) -> DeploymentStatus {
        info!(
            "Scheduling deployment {} of {}",
            self.deployment.id, self.deployment.application_id
        );

        if self.deployment.status != DeploymentStatus::Running {
            self.report_deployment_status(DeploymentStatus::Running, "").await;
        }

        let deadline = Instant::now() + self.deployment_timeout();
        let mut failure_reason: Option<String> = None;
        let mut cancelled = false;

        loop {
            if self.sig.signal() == StopSignalKind::Terminate {
                return self.handle_shutdown().await;
            }
            if Instant::now() > deadline {
                failure_reason = Some("deployment timed out".to_string());
                break;
            }

            let Some(index) = self.next_eligible_stage() else {
                break;
            };

            let status = self.execute_stage(index, false).await;
            match status {
                StageStatus::Success | StageStatus::Skipped => continue,
                StageStatus::Cancelled => {
                    cancelled = true;
                    break;
                }
                StageStatus::Failure => {
                    failure_reason = Some(self.deployment.stages[index].status_reason.clone());
                    break;
                }
                // Still running: the agent is terminating mid-stage.
                _ => return self.handle_shutdown().await,
            }
        }

        if self.sig.signal() == StopSignalKind::Terminate {
            return self.handle_shutdown().await;
        }

        // Route into the rollback stage when requested.
        let auto_rollback = self.auto_rollback();
        let wants_rollback = if cancelled {
            self.sig.signal().rollback_requested(auto_rollback)
        } else {
            failure_reason.is_some() && auto_rollback
        };
        if wants_rollback {
            if let Some(index) = self.rollback_stage_index() {
                self.report_deployment_status(DeploymentStatus::RollingBack, "").await;
                // The cancel signal that routed us here must not cancel
                // the rollback itself.
                let status = self.execute_stage(index, true).await;
                if status != StageStatus::Success {
                    warn!(
                        "Rollback of deployment {} finished with {:?}",
                        self.deployment.id, status
                    );
                }
            }
        }

        let (status, reason) = if cancelled {
            if wants_rollback {
                // Rollback ran because of a cancellation; the deployment
                // still counts as failed.
                (DeploymentStatus::Failure, "cancelled".to_string())
            } else {
                (DeploymentStatus::Cancelled, "cancelled".to_string())
            }
        } else if let Some(reason) = failure_reason {
            (DeploymentStatus::Failure, reason)
        } else {
            (DeploymentStatus::Success, "".to_string())
        };

        self.complete(status, &reason).await;
        status
    }

    /// The first stage whose predecessors are all SUCCESS and which has
    /// not finished yet. The rollback stage is never eligible here.
    fn next_eligible_stage(&self) -> Option<usize> {
        for (i, stage) in self.deployment.stages.iter().enumerate() {
            if stage.name == StageName::Rollback || stage.status.is_completed() {
                continue;
            }
            let ready = stage.requires.iter().all(|id| {
                self.deployment
                    .stage(id)
                    .map(|p| p.status == StageStatus::Success)
                    .unwrap_or(false)
            });
            if ready {
                return Some(i);
            }
        }
        None
    }

    fn rollback_stage_index(&self) -> Option<usize> {
        self.deployment
            .stages
            .iter()
            .position(|s| s.name == StageName::Rollback && !s.status.is_completed())
    }

    async fn execute_stage(&mut self, index: usize, ignore_cancel: bool) -> StageStatus {
        let stage_id = self.deployment.stages[index].id.clone();
        let stage_name = self.deployment.stages[index].name;
        let original_status = self.deployment.stages[index].status;

        // Rollback runs with a fresh signal so the cancellation that
        // scheduled it cannot cancel it too. Termination still applies.
        let (_rollback_handler, sig) = if ignore_cancel {
            let (handler, sig) = StopSignal::new();
            (Some(handler), sig)
        } else {
            (None, self.sig.clone())
        };

        let Some(executor) = self
            .executors
            .get(self.deployment.kind, stage_name)
        else {
            let reason = "unsupported stage".to_string();
            self.report_stage_status(index, StageStatus::Failure, &reason).await;
            return StageStatus::Failure;
        };

        if original_status == StageStatus::NotStarted {
            self.report_stage_status(index, StageStatus::Running, "").await;
        }

        let log = Arc::new(StageLogPersister::new(
            self.api.clone(),
            &self.deployment.id,
            &stage_id,
        ));
        let stage_config = self.stage_config(index);
        let timeout = stage_config
            .as_ref()
            .filter(|c| !c.timeout.is_zero())
            .map(|c| c.timeout.as_duration())
            .unwrap_or(DEFAULT_STAGE_TIMEOUT);
        let deployment = Arc::new(self.deployment.clone());

        let result = loop {
            let input = ExecutorInput {
                stage: self.deployment.stages[index].clone(),
                stage_config: stage_config.clone(),
                deployment: deployment.clone(),
                application: self.application.clone(),
                app_spec: self.app_spec.clone(),
                provider: self.provider.clone(),
                target_dir: self.target_dir.clone(),
                running_dir: self.running_dir.clone(),
                manifests_cache: self.manifests_cache.clone(),
                command_lister: self.command_lister.clone(),
                log: log.clone(),
                metadata: self.metadata.clone(),
            };

            let attempt = tokio::time::timeout(timeout, executor.execute(&input, sig.clone()))
                .await
                .unwrap_or_else(|_| StageResult::Failure("stage timed out".to_string()));
            if let Err(e) = log.flush().await {
                warn!("Deferred flushing stage logs: {}", e);
            }

            match attempt {
                StageResult::Exited => {
                    // The stage needs another tick.
                    match sig.signal() {
                        StopSignalKind::None => {
                            tokio::time::sleep(self.tick).await;
                            continue;
                        }
                        StopSignalKind::Terminate => return StageStatus::Running,
                        _ => break StageResult::Cancelled,
                    }
                }
                other => break other,
            }
        };

        let (got, reason) = match result {
            StageResult::Success => (StageStatus::Success, String::new()),
            StageResult::Failure(reason) => (StageStatus::Failure, reason),
            StageResult::Cancelled => (StageStatus::Cancelled, "cancelled".to_string()),
            StageResult::Skipped => (StageStatus::Skipped, String::new()),
            StageResult::Exited => unreachable!("exited is consumed by the tick loop"),
        };
        let status = determine_stage_status(sig.signal(), StageStatus::Running, got);
        let reason = if status == StageStatus::Cancelled && reason.is_empty() {
            "cancelled".to_string()
        } else {
            reason
        };

        self.report_stage_status(index, status, &reason).await;
        status
    }

    /// The configured envelope for a stage, matched by pipeline position.
    fn stage_config(&self, index: usize) -> Option<PipelineStage> {
        let stage = &self.deployment.stages[index];
        if stage.predefined {
            return None;
        }
        let cfg = self
            .app_spec
            .generic()
            .get_stage(stage.index as usize)?
            .clone();
        (cfg.name == stage.name).then_some(cfg)
    }

    fn deployment_timeout(&self) -> Duration {
        let timeout = self.app_spec.generic().timeout;
        if timeout.is_zero() {
            DEFAULT_STAGE_TIMEOUT
        } else {
            timeout.as_duration()
        }
    }

    fn auto_rollback(&self) -> bool {
        self.app_spec
            .kubernetes()
            .map(|s| s.input.auto_rollback)
            .unwrap_or(true)
    }

    /// Agent shutdown: still-running stages are reported cancelled and the
    /// deployment is left non-terminal for the next run to resume.
    async fn handle_shutdown(&mut self) -> DeploymentStatus {
        info!(
            "Stopping scheduler of deployment {} for shutdown",
            self.deployment.id
        );
        for index in 0..self.deployment.stages.len() {
            if self.deployment.stages[index].status == StageStatus::Running {
                self.report_stage_status(index, StageStatus::Cancelled, "agent shutdown")
                    .await;
            }
        }
        self.deployment.status
    }

    async fn report_stage_status(&mut self, index: usize, status: StageStatus, reason: &str) {
        let stage = &mut self.deployment.stages[index];
        // Terminal states are absorbing.
        if stage.status.is_completed() {
            return;
        }
        stage.status = status;
        stage.status_reason = reason.to_string();

        metrics::counter!("piped_stage_status_changes_total").increment(1);
        let result = self
            .api
            .report_stage_status_changed(
                &self.deployment.id,
                &stage.id,
                status,
                reason,
                stage.retried_count,
            )
            .await;
        if let Err(e) = result {
            // The next idempotent update repairs a missed report.
            error!("Failed to report stage status: {}", e);
        }
    }

    async fn report_deployment_status(&mut self, status: DeploymentStatus, reason: &str) {
        self.deployment.status = status;
        self.deployment.status_reason = reason.to_string();
        if let Err(e) = self
            .api
            .report_deployment_status_changed(&self.deployment.id, status, reason)
            .await
        {
            error!("Failed to report deployment status: {}", e);
        }
    }

    async fn complete(&mut self, status: DeploymentStatus, reason: &str) {
        let stage_statuses: HashMap<String, StageStatus> = self
            .deployment
            .stages
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect();

        // Always attempt to report the terminal state before returning;
        // a failed report is repaired by the next tick's idempotent update.
        if let Err(e) = self
            .api
            .report_deployment_completed(&self.deployment.id, status, reason, stage_statuses)
            .await
        {
            error!(
                "Failed to report completion of deployment {}: {}",
                self.deployment.id, e
            );
        }
        self.deployment.status = status;

        metrics::counter!("piped_deployments_completed_total").increment(1);
        let deployment = Box::new(self.deployment.clone());
        let event = match status {
            DeploymentStatus::Success => NotificationEvent::DeploymentSucceeded { deployment },
            DeploymentStatus::Cancelled => NotificationEvent::DeploymentCancelled {
                deployment,
                commander: String::new(),
            },
            _ => NotificationEvent::DeploymentFailed {
                deployment,
                reason: reason.to_string(),
            },
        };
        self.notifier.notify(event);
        info!(
            "Deployment {} completed with {:?}",
            self.deployment.id, status
        );
    }
}

/// The error reported when no planner or executor supports the kind.
pub fn unsupported_kind_error(deployment: &Deployment) -> PipedError {
    PipedError::DeployError(format!(
        "no planner/executor support for application kind {}",
        deployment.kind
    ))
}

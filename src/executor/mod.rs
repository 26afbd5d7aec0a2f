//! Stage executors
//!
//! An executor performs one stage of a deployment and reports the result.
//! Executors share a narrow contract: execute with a stop signal, return a
//! stage result. They check the signal between logical steps so that a
//! cancelled stage returns promptly.

pub mod analysis;
pub mod cloudrun;
pub mod ecs;
pub mod kubernetes;
pub mod lambda;
pub mod logpersister;
pub mod metadata;
pub mod registry;
pub mod terraform;
pub mod wait;
pub mod waitapproval;

pub use logpersister::StageLogPersister;
pub use metadata::MetadataStore;
pub use registry::ExecutorRegistry;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::apistore::CommandLister;
use crate::cache::SingleflightCache;
use crate::cloudprovider::{CloudProvider, Manifest};
use crate::config::{AppDeploymentSpec, PipelineStage};
use crate::errors::PipedError;
use crate::model::{Application, Deployment, Stage, StageStatus};

/// The result domain of one execution attempt. Exited means the stage
/// still needs another tick, used by WaitApproval and Analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Success,
    Failure(String),
    Cancelled,
    Skipped,
    Exited,
}

/// The cancellation-and-reason value observed by an executing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignalKind {
    None,
    Cancel,
    CancelWithRollback,
    CancelWithoutRollback,
    /// Agent shutdown; the stage keeps its current status.
    Terminate,
}

impl StopSignalKind {
    pub fn is_none(&self) -> bool {
        matches!(self, StopSignalKind::None)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(
            self,
            StopSignalKind::Cancel
                | StopSignalKind::CancelWithRollback
                | StopSignalKind::CancelWithoutRollback
        )
    }

    /// Whether a rollback should run after cancellation, given the
    /// kind-level auto-rollback default.
    pub fn rollback_requested(&self, auto_rollback: bool) -> bool {
        match self {
            StopSignalKind::CancelWithRollback => true,
            StopSignalKind::CancelWithoutRollback => false,
            _ => auto_rollback,
        }
    }
}

/// Receiver half handed to the executing stage.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<StopSignalKind>,
}

impl StopSignal {
    pub fn new() -> (StopSignalHandler, StopSignal) {
        let (tx, rx) = watch::channel(StopSignalKind::None);
        (StopSignalHandler { tx }, StopSignal { rx })
    }

    /// The current signal value.
    pub fn signal(&self) -> StopSignalKind {
        *self.rx.borrow()
    }

    /// Resolve once a stop is requested. A dropped handler counts as a
    /// terminate so executors unwind during shutdown.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if !rx.borrow().is_none() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sender half held by the scheduler.
pub struct StopSignalHandler {
    tx: watch::Sender<StopSignalKind>,
}

impl StopSignalHandler {
    pub fn cancel(&self, kind: StopSignalKind) {
        let _ = self.tx.send(kind);
    }

    pub fn terminate(&self) {
        let _ = self.tx.send(StopSignalKind::Terminate);
    }

    pub fn signal(&self) -> StopSignalKind {
        *self.tx.borrow()
    }
}

/// Everything a stage execution needs, bundled as a value.
pub struct ExecutorInput {
    pub stage: Stage,
    /// The configured envelope for this stage; None for injected stages
    pub stage_config: Option<PipelineStage>,
    pub deployment: Arc<Deployment>,
    pub application: Application,
    pub app_spec: Arc<AppDeploymentSpec>,
    pub provider: Arc<dyn CloudProvider>,
    /// Deploy source checked out at the target commit
    pub target_dir: PathBuf,
    /// Deploy source checked out at the running commit, when known
    pub running_dir: Option<PathBuf>,
    pub manifests_cache: Arc<SingleflightCache<Vec<Manifest>>>,
    pub command_lister: CommandLister,
    pub log: Arc<StageLogPersister>,
    pub metadata: Arc<MetadataStore>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult;
}

/// Resolve the status to persist from the signal observed during the run.
/// A terminate keeps the original status so the next start can resume.
pub fn determine_stage_status(
    sig: StopSignalKind,
    original: StageStatus,
    got: StageStatus,
) -> StageStatus {
    match sig {
        StopSignalKind::None => got,
        StopSignalKind::Terminate => original,
        _ => StageStatus::Cancelled,
    }
}

// Shared helpers for the providers that deploy whole definition sets.

/// Load the target-commit manifests through the single-flight cache.
pub(crate) async fn load_target_manifests(
    input: &ExecutorInput,
) -> Result<Vec<Manifest>, PipedError> {
    let key = format!(
        "{}:{}",
        input.application.id, input.deployment.trigger.commit.hash
    );
    let provider = input.provider.clone();
    let dir = input.target_dir.clone();
    let spec = input.app_spec.clone();
    input
        .manifests_cache
        .get_or_load(&key, || async move {
            provider.load_manifests(&dir, &spec).await
        })
        .await
}

/// Load the running-commit manifests, used by rollback and baselines.
pub(crate) async fn load_running_manifests(
    input: &ExecutorInput,
) -> Result<Vec<Manifest>, PipedError> {
    let dir = input.running_dir.clone().ok_or_else(|| {
        PipedError::DeployError("the running commit deploy source is unknown".to_string())
    })?;
    let key = format!(
        "{}:{}",
        input.application.id, input.deployment.running_commit_hash
    );
    let provider = input.provider.clone();
    let spec = input.app_spec.clone();
    input
        .manifests_cache
        .get_or_load(&key, || async move { provider.load_manifests(&dir, &spec).await })
        .await
}

/// Apply the target manifests, checking the signal before the mutation.
pub(crate) async fn apply_target(input: &ExecutorInput, sig: &StopSignal) -> StageResult {
    let manifests = match load_target_manifests(input).await {
        Ok(m) => m,
        Err(e) => {
            input.log.error(format!("Failed to load manifests: {}", e));
            return StageResult::Failure(format!("failed to load manifests: {}", e));
        }
    };

    if sig.signal().is_cancel() {
        return StageResult::Cancelled;
    }

    input
        .log
        .info(format!("Applying {} manifests...", manifests.len()));
    if let Err(e) = input
        .provider
        .apply(
            &input.application.id,
            &input.target_dir,
            &input.app_spec,
            &manifests,
        )
        .await
    {
        input.log.error(format!("Failed to apply manifests: {}", e));
        return StageResult::Failure(format!("failed to apply manifests: {}", e));
    }
    input.log.success("Successfully applied all manifests");
    StageResult::Success
}

/// Re-apply the running-commit manifests to roll the application back.
pub(crate) async fn rollback_to_running(input: &ExecutorInput) -> StageResult {
    let manifests = match load_running_manifests(input).await {
        Ok(m) => m,
        Err(e) => {
            input.log.error(format!("Unable to roll back: {}", e));
            return StageResult::Failure(format!("unable to roll back: {}", e));
        }
    };

    let dir = input.running_dir.clone().unwrap_or_else(|| input.target_dir.clone());
    input.log.info(format!(
        "Rolling back to commit {}...",
        input.deployment.running_commit_hash
    ));
    if let Err(e) = input
        .provider
        .apply(&input.application.id, &dir, &input.app_spec, &manifests)
        .await
    {
        input.log.error(format!("Failed to roll back: {}", e));
        return StageResult::Failure(format!("failed to roll back: {}", e));
    }
    input.log.success("Successfully rolled back the application");
    StageResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determine_stage_status() {
        // No signal: the executor result stands.
        assert_eq!(
            determine_stage_status(
                StopSignalKind::None,
                StageStatus::Running,
                StageStatus::Success
            ),
            StageStatus::Success
        );
        // Cancel overrides whatever the executor returned.
        assert_eq!(
            determine_stage_status(
                StopSignalKind::CancelWithRollback,
                StageStatus::Running,
                StageStatus::Success
            ),
            StageStatus::Cancelled
        );
        // Terminate keeps the original status for the next start.
        assert_eq!(
            determine_stage_status(
                StopSignalKind::Terminate,
                StageStatus::Running,
                StageStatus::Failure
            ),
            StageStatus::Running
        );
    }

    #[test]
    fn test_rollback_requested() {
        assert!(StopSignalKind::CancelWithRollback.rollback_requested(false));
        assert!(!StopSignalKind::CancelWithoutRollback.rollback_requested(true));
        assert!(StopSignalKind::Cancel.rollback_requested(true));
        assert!(!StopSignalKind::Cancel.rollback_requested(false));
    }

    #[tokio::test]
    async fn test_stop_signal_wakes_waiters() {
        let (handler, sig) = StopSignal::new();
        assert!(sig.signal().is_none());

        let waiter = {
            let sig = sig.clone();
            tokio::spawn(async move {
                sig.stopped().await;
                sig.signal()
            })
        };

        handler.cancel(StopSignalKind::Cancel);
        assert_eq!(waiter.await.unwrap(), StopSignalKind::Cancel);
    }
}

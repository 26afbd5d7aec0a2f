//! In-memory API client for tests
//!
//! Mirrors the control plane just enough to drive the trigger, planner and
//! controller without a network. Mutations are recorded so tests can assert
//! on the exact report sequence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    ApplicationLiveStateEvent, LogBlock, PipedService, ReportPipedMetaRequest,
};
use crate::errors::PipedError;
use crate::model::{
    Application, ApplicationSyncState, Command, Deployment, DeploymentStatus, Environment, Event,
    Stage, StageStatus,
};

/// A report observed by the fake, in call order.
#[derive(Debug, Clone)]
pub enum RecordedCall {
    DeploymentPlanned {
        deployment_id: String,
        summary: String,
        stage_names: Vec<String>,
    },
    DeploymentStatus {
        deployment_id: String,
        status: DeploymentStatus,
        reason: String,
    },
    StageStatus {
        deployment_id: String,
        stage_id: String,
        status: StageStatus,
        reason: String,
    },
    DeploymentCompleted {
        deployment_id: String,
        status: DeploymentStatus,
        reason: String,
    },
    SyncState {
        application_id: String,
        state: ApplicationSyncState,
    },
    CommandHandled {
        command_id: String,
    },
}

#[derive(Default)]
struct State {
    applications: Vec<Application>,
    deployments: Vec<Deployment>,
    commands: Vec<Command>,
    events: Vec<Event>,
    environments: HashMap<String, Environment>,
    calls: Vec<RecordedCall>,
}

/// Fake implementation of [`PipedService`].
#[derive(Default)]
pub struct FakeApiClient {
    state: Mutex<State>,
}

impl FakeApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_applications(&self, applications: Vec<Application>) {
        self.lock().applications = applications;
    }

    pub fn set_deployments(&self, deployments: Vec<Deployment>) {
        self.lock().deployments = deployments;
    }

    pub fn push_command(&self, command: Command) {
        self.lock().commands.push(command);
    }

    pub fn push_event(&self, event: Event) {
        self.lock().events.push(event);
    }

    pub fn put_environment(&self, env: Environment) {
        self.lock().environments.insert(env.id.clone(), env);
    }

    /// Every recorded report, in call order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Deployments currently held by the fake control plane.
    pub fn deployments(&self) -> Vec<Deployment> {
        self.lock().deployments.clone()
    }
}

#[async_trait]
impl PipedService for FakeApiClient {
    async fn report_piped_meta(&self, _req: ReportPipedMetaRequest) -> Result<(), PipedError> {
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, PipedError> {
        Ok(self.lock().applications.clone())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError> {
        Ok(self
            .lock()
            .deployments
            .iter()
            .filter(|d| !d.status.is_completed())
            .cloned()
            .collect())
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError> {
        Ok(self
            .lock()
            .commands
            .iter()
            .filter(|c| !c.handled)
            .cloned()
            .collect())
    }

    async fn list_events(&self) -> Result<Vec<Event>, PipedError> {
        Ok(self.lock().events.clone())
    }

    async fn get_latest_event(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Event, PipedError> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.name == name && e.matches_labels(labels))
            .max_by_key(|e| e.created_at)
            .cloned()
            .ok_or_else(|| PipedError::NotFound(format!("event {}", name)))
    }

    async fn get_environment(&self, id: &str) -> Result<Environment, PipedError> {
        self.lock()
            .environments
            .get(id)
            .cloned()
            .ok_or_else(|| PipedError::NotFound(format!("environment {}", id)))
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<(), PipedError> {
        let mut state = self.lock();
        // Idempotent on (application, commit).
        let exists = state.deployments.iter().any(|d| {
            d.application_id == deployment.application_id
                && d.trigger.commit.hash == deployment.trigger.commit.hash
        });
        if !exists {
            state.deployments.push(deployment);
        }
        Ok(())
    }

    async fn report_deployment_planned(
        &self,
        deployment_id: &str,
        summary: &str,
        stages: Vec<Stage>,
        running_commit_hash: &str,
    ) -> Result<(), PipedError> {
        let mut state = self.lock();
        let stage_names = stages.iter().map(|s| s.name.to_string()).collect();
        if let Some(d) = state.deployments.iter_mut().find(|d| d.id == deployment_id) {
            d.status = DeploymentStatus::Planned;
            d.summary = summary.to_string();
            d.stages = stages;
            d.running_commit_hash = running_commit_hash.to_string();
            d.updated_at = Utc::now();
        }
        state.calls.push(RecordedCall::DeploymentPlanned {
            deployment_id: deployment_id.to_string(),
            summary: summary.to_string(),
            stage_names,
        });
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<(), PipedError> {
        let mut state = self.lock();
        if let Some(d) = state.deployments.iter_mut().find(|d| d.id == deployment_id) {
            d.status = status;
            d.status_reason = reason.to_string();
            d.updated_at = Utc::now();
        }
        state.calls.push(RecordedCall::DeploymentStatus {
            deployment_id: deployment_id.to_string(),
            status,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_id: &str,
        status: StageStatus,
        reason: &str,
        retried_count: u32,
    ) -> Result<(), PipedError> {
        let mut state = self.lock();
        if let Some(d) = state.deployments.iter_mut().find(|d| d.id == deployment_id) {
            if let Some(s) = d.stages.iter_mut().find(|s| s.id == stage_id) {
                s.status = status;
                s.status_reason = reason.to_string();
                s.retried_count = retried_count;
                s.updated_at = Utc::now();
                if status.is_completed() {
                    s.completed_at = Some(Utc::now());
                }
            }
        }
        state.calls.push(RecordedCall::StageStatus {
            deployment_id: deployment_id.to_string(),
            stage_id: stage_id.to_string(),
            status,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn report_deployment_completed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        stage_statuses: HashMap<String, StageStatus>,
    ) -> Result<(), PipedError> {
        let mut state = self.lock();
        if let Some(d) = state.deployments.iter_mut().find(|d| d.id == deployment_id) {
            d.status = status;
            d.status_reason = reason.to_string();
            d.completed_at = Some(Utc::now());
            for (stage_id, stage_status) in &stage_statuses {
                if let Some(s) = d.stages.iter_mut().find(|s| &s.id == stage_id) {
                    s.status = *stage_status;
                }
            }
        }
        state.calls.push(RecordedCall::DeploymentCompleted {
            deployment_id: deployment_id.to_string(),
            status,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        sync_state: ApplicationSyncState,
    ) -> Result<(), PipedError> {
        let mut state = self.lock();
        if let Some(app) = state
            .applications
            .iter_mut()
            .find(|a| a.id == application_id)
        {
            app.sync_state = Some(sync_state.clone());
        }
        state.calls.push(RecordedCall::SyncState {
            application_id: application_id.to_string(),
            state: sync_state,
        });
        Ok(())
    }

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), PipedError> {
        let mut state = self.lock();
        if let Some(d) = state.deployments.iter_mut().find(|d| d.id == deployment_id) {
            d.metadata.extend(metadata);
        }
        Ok(())
    }

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), PipedError> {
        let mut state = self.lock();
        if let Some(d) = state.deployments.iter_mut().find(|d| d.id == deployment_id) {
            if let Some(s) = d.stages.iter_mut().find(|s| s.id == stage_id) {
                s.metadata.extend(metadata);
            }
        }
        Ok(())
    }

    async fn report_stage_logs(
        &self,
        _deployment_id: &str,
        _stage_id: &str,
        _blocks: Vec<LogBlock>,
    ) -> Result<(), PipedError> {
        Ok(())
    }

    async fn report_application_live_state_events(
        &self,
        _events: Vec<ApplicationLiveStateEvent>,
    ) -> Result<(), PipedError> {
        Ok(())
    }

    async fn report_command_handled(&self, command_id: &str) -> Result<(), PipedError> {
        let mut state = self.lock();
        if let Some(c) = state.commands.iter_mut().find(|c| c.id == command_id) {
            c.handled = true;
        }
        state.calls.push(RecordedCall::CommandHandled {
            command_id: command_id.to_string(),
        });
        Ok(())
    }

    async fn report_stats(&self, _piped_stats: String) -> Result<(), PipedError> {
        Ok(())
    }
}

//! Control-plane API client
//!
//! A thin RPC wrapper over the operations the agent uses against the
//! control plane. Every request carries the piped token; unary calls are
//! idempotent or protected by a stable operation id supplied by the caller.

pub mod client;
pub mod fake;

pub use client::ApiClient;
pub use fake::{FakeApiClient, RecordedCall};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloudprovider::Manifest;
use crate::errors::PipedError;
use crate::model::{
    Application, ApplicationKind, ApplicationSyncState, Command, Deployment, DeploymentStatus,
    Environment, Event, Stage, StageStatus,
};

/// Repository descriptor reported in the piped meta handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipedRepository {
    pub id: String,
    pub remote: String,
    pub branch: String,
}

/// Cloud provider descriptor reported in the piped meta handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipedCloudProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// How this piped encrypts sealed secrets, shared so the console can seal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSecretEncryption {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPipedMetaRequest {
    pub version: String,
    pub repositories: Vec<PipedRepository>,
    pub cloud_providers: Vec<PipedCloudProvider>,
    #[serde(default)]
    pub sealed_secret_encryption: Option<SealedSecretEncryption>,
}

/// A chunk of stage log streamed to the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBlock {
    pub index: u64,
    pub log: String,
    pub severity: LogSeverity,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Info,
    Success,
    Error,
}

/// One live-state observation for an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationLiveStateEvent {
    pub application_id: String,
    pub env_id: String,
    pub kind: ApplicationKind,
    /// Monotonic per-application snapshot version
    pub version: u64,
    pub resources: Vec<Manifest>,
    pub timestamp: DateTime<Utc>,
}

/// The operations the agent performs against the control plane.
#[async_trait]
pub trait PipedService: Send + Sync {
    /// Report the handshake metadata; retried by the caller at startup.
    async fn report_piped_meta(&self, req: ReportPipedMetaRequest) -> Result<(), PipedError>;

    async fn list_applications(&self) -> Result<Vec<Application>, PipedError>;

    /// Deployments that have not reached a terminal state.
    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError>;

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError>;

    async fn list_events(&self) -> Result<Vec<Event>, PipedError>;

    /// Latest event matching name and labels; NotFound when none exists.
    async fn get_latest_event(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Event, PipedError>;

    /// NotFound when the environment is unknown.
    async fn get_environment(&self, id: &str) -> Result<Environment, PipedError>;

    /// Create a deployment record; idempotent on (application, commit).
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), PipedError>;

    /// Persist the plan: stage list, summary and PENDING -> PLANNED.
    async fn report_deployment_planned(
        &self,
        deployment_id: &str,
        summary: &str,
        stages: Vec<Stage>,
        running_commit_hash: &str,
    ) -> Result<(), PipedError>;

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<(), PipedError>;

    /// Deduplicated server-side on (deployment, stage, status).
    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_id: &str,
        status: StageStatus,
        reason: &str,
        retried_count: u32,
    ) -> Result<(), PipedError>;

    async fn report_deployment_completed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        stage_statuses: HashMap<String, StageStatus>,
    ) -> Result<(), PipedError>;

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: ApplicationSyncState,
    ) -> Result<(), PipedError>;

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), PipedError>;

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), PipedError>;

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        blocks: Vec<LogBlock>,
    ) -> Result<(), PipedError>;

    async fn report_application_live_state_events(
        &self,
        events: Vec<ApplicationLiveStateEvent>,
    ) -> Result<(), PipedError>;

    /// At-most-once acknowledgement that a command was handled.
    async fn report_command_handled(&self, command_id: &str) -> Result<(), PipedError>;

    /// Ship a Prometheus exposition snapshot of the agent's own metrics.
    async fn report_stats(&self, piped_stats: String) -> Result<(), PipedError>;
}

/// Constant-interval retry for calls that are safe to repeat.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_calls: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_calls: 5,
            interval: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_calls: u32, interval: Duration) -> Self {
        Self {
            max_calls,
            interval,
        }
    }

    /// Run the operation until it succeeds or the calls are exhausted.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, PipedError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipedError>>,
    {
        let mut last_err = None;
        for call in 0..self.max_calls {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::warn!("call {} failed, waiting for the next retry: {}", call + 1, e);
                    last_err = Some(e);
                }
            }
            if call + 1 < self.max_calls {
                tokio::time::sleep(self.interval).await;
            }
        }
        Err(last_err.unwrap_or_else(|| PipedError::Internal("retry with zero calls".to_string())))
    }
}

/// Build the bearer token attached to every request.
pub fn make_piped_token(project_id: &str, piped_id: &str, piped_key: &str) -> String {
    format!("piped-token:{}/{}/{}", project_id, piped_id, piped_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_make_piped_token() {
        assert_eq!(
            make_piped_token("proj", "piped-1", "secret"),
            "piped-token:proj/piped-1/secret"
        );
    }

    #[tokio::test]
    async fn test_retry_policy_stops_on_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result = policy
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(PipedError::ApiError("unavailable".to_string()))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_policy_exhausts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<(), _> = policy
            .run(|| async { Err(PipedError::ApiError("down".to_string())) })
            .await;
        assert!(result.is_err());
    }
}

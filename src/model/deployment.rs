//! Deployment and stage models

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::application::ApplicationKind;

/// Status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Planned,
    Running,
    RollingBack,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    /// Terminal statuses are absorbing.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
        )
    }
}

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            StageStatus::Success
                | StageStatus::Failure
                | StageStatus::Cancelled
                | StageStatus::Skipped
        )
    }
}

/// Well-known stage names. The set of valid names depends on the
/// application kind; the executor registry enforces that at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    #[serde(rename = "WAIT")]
    Wait,
    #[serde(rename = "WAIT_APPROVAL")]
    WaitApproval,
    #[serde(rename = "ANALYSIS")]
    Analysis,

    #[serde(rename = "K8S_SYNC")]
    K8sSync,
    #[serde(rename = "K8S_PRIMARY_ROLLOUT")]
    K8sPrimaryRollout,
    #[serde(rename = "K8S_CANARY_ROLLOUT")]
    K8sCanaryRollout,
    #[serde(rename = "K8S_CANARY_CLEAN")]
    K8sCanaryClean,
    #[serde(rename = "K8S_BASELINE_ROLLOUT")]
    K8sBaselineRollout,
    #[serde(rename = "K8S_BASELINE_CLEAN")]
    K8sBaselineClean,
    #[serde(rename = "K8S_TRAFFIC_ROUTING")]
    K8sTrafficRouting,

    #[serde(rename = "TERRAFORM_SYNC")]
    TerraformSync,
    #[serde(rename = "TERRAFORM_PLAN")]
    TerraformPlan,
    #[serde(rename = "TERRAFORM_APPLY")]
    TerraformApply,

    #[serde(rename = "CLOUDRUN_SYNC")]
    CloudRunSync,
    #[serde(rename = "CLOUDRUN_PROMOTE")]
    CloudRunPromote,

    #[serde(rename = "LAMBDA_SYNC")]
    LambdaSync,
    #[serde(rename = "LAMBDA_CANARY_ROLLOUT")]
    LambdaCanaryRollout,
    #[serde(rename = "LAMBDA_PROMOTE")]
    LambdaPromote,

    #[serde(rename = "ECS_SYNC")]
    EcsSync,

    /// Predefined stage injected by the controller when a deployment is
    /// cancelled with rollback or fails mid-pipeline.
    #[serde(rename = "ROLLBACK")]
    Rollback,
}

impl StageName {
    /// The single-stage sync name for the given application kind.
    pub fn quick_sync_for(kind: ApplicationKind) -> StageName {
        match kind {
            ApplicationKind::Kubernetes => StageName::K8sSync,
            ApplicationKind::Terraform => StageName::TerraformSync,
            ApplicationKind::CloudRun => StageName::CloudRunSync,
            ApplicationKind::Lambda => StageName::LambdaSync,
            ApplicationKind::Ecs => StageName::EcsSync,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serialize through serde to keep a single source of wire names.
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// A single step within a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Unique within the deployment
    pub id: String,

    pub name: StageName,

    #[serde(default)]
    pub desc: String,

    /// Index in the planned order, used for display
    #[serde(default)]
    pub index: u32,

    /// Whether this stage was injected by the agent rather than declared
    /// in the pipeline configuration
    #[serde(default)]
    pub predefined: bool,

    /// Ids of stages that must reach SUCCESS before this one may start
    #[serde(default)]
    pub requires: Vec<String>,

    /// Hidden stages (e.g. a pending rollback) are not rendered by the UI
    #[serde(default = "default_visible")]
    pub visible: bool,

    pub status: StageStatus,

    #[serde(default)]
    pub status_reason: String,

    /// Opaque key/value pairs recorded during execution, e.g. the approver
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub retried_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_visible() -> bool {
    true
}

impl Stage {
    /// Create a not-started stage with the given id and name.
    pub fn new(id: impl Into<String>, name: StageName) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name,
            desc: String::new(),
            index: 0,
            predefined: false,
            requires: Vec::new(),
            visible: true,
            status: StageStatus::NotStarted,
            status_reason: String::new(),
            metadata: HashMap::new(),
            retried_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// The commit that triggered a deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Why and by whom a deployment was created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentTrigger {
    pub commit: Commit,

    /// User who requested the deployment; empty for automatic triggers
    #[serde(default)]
    pub commander: String,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An attempt to converge an application to a specific commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    #[serde(default)]
    pub application_name: String,
    pub env_id: String,
    pub kind: ApplicationKind,
    #[serde(default)]
    pub cloud_provider: String,

    pub trigger: DeploymentTrigger,

    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,

    /// Ordered stage list; empty until the deployment is planned
    #[serde(default)]
    pub stages: Vec<Stage>,

    /// Hash of the most recent successful commit at planning time,
    /// recorded so rollback knows where to return to
    #[serde(default)]
    pub running_commit_hash: String,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Find a stage by id.
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// The rollback stage, if the plan includes one.
    pub fn rollback_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == StageName::Rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(DeploymentStatus::Success.is_completed());
        assert!(DeploymentStatus::Failure.is_completed());
        assert!(DeploymentStatus::Cancelled.is_completed());
        assert!(!DeploymentStatus::Running.is_completed());
        assert!(!DeploymentStatus::Pending.is_completed());

        assert!(StageStatus::Skipped.is_completed());
        assert!(!StageStatus::Running.is_completed());
        assert!(!StageStatus::NotStarted.is_completed());
    }

    #[test]
    fn test_stage_name_wire_format() {
        let s = serde_json::to_string(&StageName::K8sPrimaryRollout).unwrap();
        assert_eq!(s, "\"K8S_PRIMARY_ROLLOUT\"");
        assert_eq!(StageName::WaitApproval.to_string(), "WAIT_APPROVAL");
    }

    #[test]
    fn test_quick_sync_stage_per_kind() {
        assert_eq!(
            StageName::quick_sync_for(ApplicationKind::Kubernetes),
            StageName::K8sSync
        );
        assert_eq!(
            StageName::quick_sync_for(ApplicationKind::Ecs),
            StageName::EcsSync
        );
    }
}

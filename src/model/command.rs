//! Command model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of imperative a user issued from the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    SyncApplication,
    CancelDeployment,
    ApproveStage,
}

/// A user-initiated imperative observed through the command store.
/// Acknowledged back to the control plane at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,

    /// User who issued the command
    #[serde(default)]
    pub commander: String,

    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub stage_id: String,

    /// CancelDeployment: run the rollback stage after cancelling
    #[serde(default)]
    pub force_rollback: bool,
    /// CancelDeployment: cancel without running the rollback stage
    #[serde(default)]
    pub force_no_rollback: bool,

    #[serde(default)]
    pub handled: bool,

    pub created_at: DateTime<Utc>,
}

impl Command {
    /// Whether this command cancels the given deployment.
    pub fn cancels_deployment(&self, deployment_id: &str) -> bool {
        self.kind == CommandKind::CancelDeployment && self.deployment_id == deployment_id
    }

    /// Whether this command approves the given stage.
    pub fn approves_stage(&self, deployment_id: &str, stage_id: &str) -> bool {
        self.kind == CommandKind::ApproveStage
            && self.deployment_id == deployment_id
            && self.stage_id == stage_id
    }
}

//! Control-plane entity model
//!
//! Shared data types exchanged with the control plane. Entities are cached
//! by the api stores and handed out as read-only snapshots; the agent never
//! mutates them locally except through explicit report calls.

pub mod application;
pub mod command;
pub mod deployment;
pub mod event;

pub use application::{
    Application, ApplicationGitPath, ApplicationKind, ApplicationSyncState, SyncStatus,
};
pub use command::{Command, CommandKind};
pub use deployment::{
    Commit, Deployment, DeploymentStatus, DeploymentTrigger, Stage, StageName, StageStatus,
};
pub use event::Event;

use serde::{Deserialize, Serialize};

/// An environment registered on the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
}

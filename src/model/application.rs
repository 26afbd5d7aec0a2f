//! Application model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The runtime kind an application is deployed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationKind {
    Kubernetes,
    Terraform,
    CloudRun,
    Lambda,
    Ecs,
}

impl std::fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplicationKind::Kubernetes => "KUBERNETES",
            ApplicationKind::Terraform => "TERRAFORM",
            ApplicationKind::CloudRun => "CLOUD_RUN",
            ApplicationKind::Lambda => "LAMBDA",
            ApplicationKind::Ecs => "ECS",
        };
        f.write_str(s)
    }
}

/// Where an application lives inside a registered Git repository
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationGitPath {
    /// Repository id as registered in the piped configuration
    pub repo_id: String,

    /// Relative path from the repository root to the application directory
    pub path: String,

    /// Branch the application is deployed from
    #[serde(default)]
    pub branch: String,

    /// The deployment configuration filename, default ".pipe.yaml"
    #[serde(default)]
    pub config_filename: String,
}

impl ApplicationGitPath {
    /// The configuration filename, falling back to the default.
    pub fn config_file(&self) -> &str {
        if self.config_filename.is_empty() {
            ".pipe.yaml"
        } else {
            &self.config_filename
        }
    }
}

/// Sync status judged by the drift detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Unknown,
    Synced,
    Deploying,
    OutOfSync,
    InvalidConfig,
}

/// The agent's judgment of whether live state matches the desired Git state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationSyncState {
    pub status: SyncStatus,

    /// One-line summary naming the first divergent resource
    #[serde(default)]
    pub short_reason: String,

    /// Full reason, e.g. the loader error for INVALID_CONFIG
    #[serde(default)]
    pub reason: String,

    /// The most recent deployment driving the application
    #[serde(default)]
    pub head_deployment_id: String,

    pub timestamp: DateTime<Utc>,
}

impl ApplicationSyncState {
    /// Whether two states carry the same observable judgment.
    /// Timestamps are ignored so that re-detection of an unchanged world
    /// does not produce a new report.
    pub fn same_as(&self, other: &ApplicationSyncState) -> bool {
        self.status == other.status
            && self.short_reason == other.short_reason
            && self.reason == other.reason
            && self.head_deployment_id == other.head_deployment_id
    }
}

/// An identified unit of deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub env_id: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,

    /// Name of the cloud provider this application is deployed to,
    /// as declared in the piped configuration
    pub cloud_provider: String,

    #[serde(default)]
    pub disabled: bool,

    /// Hash of the commit that produced the currently running state.
    /// Empty until the first successful deployment.
    #[serde(default)]
    pub most_recent_successful_commit_hash: String,

    #[serde(default)]
    pub sync_state: Option<ApplicationSyncState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_same_as_ignores_timestamp() {
        let a = ApplicationSyncState {
            status: SyncStatus::Synced,
            timestamp: Utc::now(),
            ..Default::default()
        };
        let mut b = a.clone();
        b.timestamp = Utc::now() + chrono::Duration::seconds(90);
        assert!(a.same_as(&b));

        b.status = SyncStatus::OutOfSync;
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_config_file_default() {
        let p = ApplicationGitPath::default();
        assert_eq!(p.config_file(), ".pipe.yaml");

        let p = ApplicationGitPath {
            config_filename: "deploy.yaml".to_string(),
            ..Default::default()
        };
        assert_eq!(p.config_file(), "deploy.yaml");
    }
}

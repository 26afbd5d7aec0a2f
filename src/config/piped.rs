//! Agent configuration spec

use serde::{Deserialize, Serialize};

use super::ConfigDuration;
use crate::errors::PipedError;

/// Configuration for one piped process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedSpec {
    /// Address of the control-plane API, host:port
    pub api_address: String,

    /// Address shown in links back to the web console
    #[serde(default)]
    pub web_address: String,

    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(rename = "pipedID")]
    pub piped_id: String,

    /// Path to the file holding this piped's signing key
    pub piped_key_file: String,

    /// How often to check for applications that should be synced
    #[serde(default = "default_sync_interval")]
    pub sync_interval: ConfigDuration,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub repositories: Vec<Repository>,

    #[serde(default)]
    pub chart_repositories: Vec<ChartRepository>,

    #[serde(default)]
    pub cloud_providers: Vec<CloudProviderConfig>,

    #[serde(default)]
    pub sealed_secret_management: Option<SealedSecretManagement>,

    #[serde(default)]
    pub notifications: Notifications,
}

fn default_sync_interval() -> ConfigDuration {
    ConfigDuration::from_secs(60)
}

impl PipedSpec {
    pub fn validate(&mut self) -> Result<(), PipedError> {
        if self.api_address.is_empty() {
            return Err(PipedError::ConfigError("apiAddress must be set".to_string()));
        }
        if self.project_id.is_empty() {
            return Err(PipedError::ConfigError("projectID must be set".to_string()));
        }
        if self.piped_id.is_empty() {
            return Err(PipedError::ConfigError("pipedID must be set".to_string()));
        }
        if self.piped_key_file.is_empty() {
            return Err(PipedError::ConfigError(
                "pipedKeyFile must be set".to_string(),
            ));
        }
        for (i, repo) in self.repositories.iter().enumerate() {
            if repo.repo_id.is_empty() {
                return Err(PipedError::ConfigError(format!(
                    "repositories[{}].repoId must be set",
                    i
                )));
            }
            if self
                .repositories
                .iter()
                .filter(|r| r.repo_id == repo.repo_id)
                .count()
                > 1
            {
                return Err(PipedError::ConfigError(format!(
                    "duplicated repository id: {}",
                    repo.repo_id
                )));
            }
        }
        if let Some(ssm) = &self.sealed_secret_management {
            ssm.validate()?;
        }
        Ok(())
    }

    /// Find a registered repository by id.
    pub fn repository(&self, repo_id: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.repo_id == repo_id)
    }

    /// Find a configured cloud provider by name.
    pub fn cloud_provider(&self, name: &str) -> Option<&CloudProviderConfig> {
        self.cloud_providers.iter().find(|p| p.name == name)
    }
}

/// Identity used for Git operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    /// Path to the SSH key used to clone private repositories
    #[serde(default)]
    pub ssh_key_file: String,
}

/// A Git repository watched by this piped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub repo_id: String,
    pub remote: String,
    pub branch: String,
}

/// A Helm chart repository to register at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRepository {
    pub name: String,
    pub address: String,
}

/// The runtime a cloud provider entry targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloudProviderKind {
    Kubernetes,
    Terraform,
    CloudRun,
    Lambda,
    Ecs,
}

/// A named cloud provider this piped can deploy to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CloudProviderKind,

    /// Kubernetes: path to the kubeconfig file, empty for in-cluster
    #[serde(default)]
    pub kubeconfig_path: String,
    /// Kubernetes: namespace to restrict apply/watch to
    #[serde(default)]
    pub namespace: String,

    /// GCP providers: project and region
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub region: String,
    /// Path to a credentials file for the provider, when not ambient
    #[serde(default)]
    pub credentials_file: String,
}

/// How sealed secrets stored in Git are decrypted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecretManagement {
    #[serde(rename = "type")]
    pub kind: SealedSecretManagementKind,
    #[serde(default)]
    pub private_key_file: String,
    #[serde(default)]
    pub public_key_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SealedSecretManagementKind {
    None,
    SealingKey,
    GcpKms,
    AwsKms,
}

impl SealedSecretManagement {
    pub fn validate(&self) -> Result<(), PipedError> {
        match self.kind {
            SealedSecretManagementKind::None => Ok(()),
            SealedSecretManagementKind::SealingKey => {
                if self.private_key_file.is_empty() {
                    return Err(PipedError::ConfigError(
                        "sealedSecretManagement.privateKeyFile must be set".to_string(),
                    ));
                }
                Ok(())
            }
            kind => Err(PipedError::ConfigError(format!(
                "unsupported sealed secret management type: {:?}",
                kind
            ))),
        }
    }
}

/// Notification routing table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notifications {
    #[serde(default)]
    pub routes: Vec<NotificationRoute>,
    #[serde(default)]
    pub receivers: Vec<NotificationReceiver>,
}

impl Notifications {
    pub fn receiver(&self, name: &str) -> Option<&NotificationReceiver> {
        self.receivers.iter().find(|r| r.name == name)
    }
}

/// Matches internal events onto a receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRoute {
    pub name: String,
    pub receiver: String,

    /// Event names to match; empty matches all
    #[serde(default)]
    pub events: Vec<String>,
    /// Restrict to these application ids; empty matches all
    #[serde(default)]
    pub apps: Vec<String>,
    /// Restrict to these environment ids; empty matches all
    #[serde(default)]
    pub envs: Vec<String>,
}

/// A destination events can be dispatched to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReceiver {
    pub name: String,
    #[serde(default)]
    pub webhook: Option<WebhookReceiver>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceiver {
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const MINIMAL: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  apiAddress: control-plane:443
  projectID: demo
  pipedID: piped-1
  pipedKeyFile: /etc/piped/key
  repositories:
    - repoId: main
      remote: git@github.com:org/manifests.git
      branch: master
  cloudProviders:
    - name: kubernetes-default
      type: KUBERNETES
"#;

    #[test]
    fn test_minimal_piped_spec() {
        let spec = Config::from_yaml(MINIMAL).unwrap().piped_spec().unwrap();
        assert_eq!(spec.project_id, "demo");
        assert_eq!(spec.repositories.len(), 1);
        assert!(spec.repository("main").is_some());
        assert!(spec.repository("other").is_none());
        assert!(spec.cloud_provider("kubernetes-default").is_some());
        assert_eq!(spec.sync_interval.as_duration().as_secs(), 60);
    }

    #[test]
    fn test_missing_piped_key_file() {
        let doc = MINIMAL.replace("  pipedKeyFile: /etc/piped/key\n", "");
        assert!(Config::from_yaml(&doc).is_err());
    }

    #[test]
    fn test_duplicated_repo_id_rejected() {
        let doc = MINIMAL.replace(
            "      branch: master\n",
            "      branch: master\n    - repoId: main\n      remote: git@github.com:org/b.git\n      branch: master\n",
        );
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("duplicated repository id"));
    }
}

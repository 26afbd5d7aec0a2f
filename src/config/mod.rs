//! Configuration loading
//!
//! All configuration files are YAML and carry the same envelope:
//! `{apiVersion, kind, spec}`. The spec is decoded against the kind;
//! unknown kinds are rejected.

pub mod deployment;
pub mod piped;

pub use deployment::{
    AnalysisHttp, AnalysisLog, AnalysisMetrics, AnalysisStageOptions, AppDeploymentSpec,
    CloudRunDeploymentSpec, DeploymentCommitMatcher, DeploymentPipeline, EcsDeploymentSpec,
    GenericDeploymentSpec, KubernetesDeploymentSpec, LambdaDeploymentSpec, PipelineStage,
    Replicas, SealedSecretMapping, StageOptions, TerraformDeploymentSpec, WaitApprovalStageOptions,
    WaitStageOptions,
};
pub use piped::{
    ChartRepository, CloudProviderConfig, CloudProviderKind, GitConfig, NotificationReceiver,
    NotificationRoute, Notifications, PipedSpec, Repository, SealedSecretManagement,
    SealedSecretManagementKind, WebhookReceiver,
};

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::PipedError;

/// The apiVersion every configuration file must carry.
pub const API_VERSION: &str = "pipecd.dev/v1beta1";

/// A parsed configuration file.
#[derive(Debug, Clone)]
pub enum Config {
    Piped(PipedSpec),
    KubernetesApp(KubernetesDeploymentSpec),
    TerraformApp(TerraformDeploymentSpec),
    CloudRunApp(CloudRunDeploymentSpec),
    LambdaApp(LambdaDeploymentSpec),
    EcsApp(EcsDeploymentSpec),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    spec: serde_yaml::Value,
}

impl Config {
    /// Parse a configuration document and validate its spec.
    pub fn from_yaml(text: &str) -> Result<Config, PipedError> {
        let envelope: Envelope = serde_yaml::from_str(text)?;
        if envelope.api_version != API_VERSION {
            return Err(PipedError::ConfigError(format!(
                "unsupported apiVersion: {}",
                envelope.api_version
            )));
        }

        let cfg = match envelope.kind.as_str() {
            "Piped" => {
                let mut spec: PipedSpec = serde_yaml::from_value(envelope.spec)?;
                spec.validate()?;
                Config::Piped(spec)
            }
            "KubernetesApp" => {
                let mut spec: KubernetesDeploymentSpec = serde_yaml::from_value(envelope.spec)?;
                spec.generic.validate()?;
                Config::KubernetesApp(spec)
            }
            "TerraformApp" => {
                let mut spec: TerraformDeploymentSpec = serde_yaml::from_value(envelope.spec)?;
                spec.generic.validate()?;
                Config::TerraformApp(spec)
            }
            "CloudRunApp" => {
                let mut spec: CloudRunDeploymentSpec = serde_yaml::from_value(envelope.spec)?;
                spec.generic.validate()?;
                Config::CloudRunApp(spec)
            }
            "LambdaApp" => {
                let mut spec: LambdaDeploymentSpec = serde_yaml::from_value(envelope.spec)?;
                spec.generic.validate()?;
                Config::LambdaApp(spec)
            }
            "EcsApp" => {
                let mut spec: EcsDeploymentSpec = serde_yaml::from_value(envelope.spec)?;
                spec.generic.validate()?;
                Config::EcsApp(spec)
            }
            // The agent recognizes the control-plane kind but never runs from it.
            "ControlPlane" => {
                return Err(PipedError::ConfigError(
                    "wrong configuration kind for piped: ControlPlane".to_string(),
                ))
            }
            other => {
                return Err(PipedError::ConfigError(format!(
                    "unknown configuration kind: {}",
                    other
                )))
            }
        };
        Ok(cfg)
    }

    /// Load and parse a configuration file.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Config, PipedError> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Config::from_yaml(&text)
    }

    /// Unwrap the piped spec, erroring for any other kind.
    pub fn piped_spec(self) -> Result<PipedSpec, PipedError> {
        match self {
            Config::Piped(spec) => Ok(spec),
            other => Err(PipedError::ConfigError(format!(
                "wrong configuration kind for piped: {}",
                other.kind_name()
            ))),
        }
    }

    /// Unwrap an application deployment spec, erroring for agent/plane kinds.
    pub fn app_spec(self) -> Result<AppDeploymentSpec, PipedError> {
        match self {
            Config::KubernetesApp(s) => Ok(AppDeploymentSpec::Kubernetes(s)),
            Config::TerraformApp(s) => Ok(AppDeploymentSpec::Terraform(s)),
            Config::CloudRunApp(s) => Ok(AppDeploymentSpec::CloudRun(s)),
            Config::LambdaApp(s) => Ok(AppDeploymentSpec::Lambda(s)),
            Config::EcsApp(s) => Ok(AppDeploymentSpec::Ecs(s)),
            Config::Piped(_) => Err(PipedError::ConfigError(
                "expected an application deployment configuration, found kind Piped".to_string(),
            )),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Config::Piped(_) => "Piped",
            Config::KubernetesApp(_) => "KubernetesApp",
            Config::TerraformApp(_) => "TerraformApp",
            Config::CloudRunApp(_) => "CloudRunApp",
            Config::LambdaApp(_) => "LambdaApp",
            Config::EcsApp(_) => "EcsApp",
        }
    }
}

/// A duration expressed as `30s`, `5m`, `6h` or a bare number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn from_secs(secs: u64) -> Self {
        ConfigDuration(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        let mut total = Duration::ZERO;
        let mut number = String::new();
        for c in s.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let n: u64 = number
                .parse()
                .map_err(|_| format!("invalid duration: {}", s))?;
            number.clear();
            let unit = match c {
                'h' => 3600,
                'm' => 60,
                's' => 1,
                _ => return Err(format!("invalid duration unit in: {}", s)),
            };
            total += Duration::from_secs(n * unit);
        }
        if !number.is_empty() {
            // Bare trailing number means seconds.
            let n: u64 = number
                .parse()
                .map_err(|_| format!("invalid duration: {}", s))?;
            total += Duration::from_secs(n);
        }
        Ok(ConfigDuration(total))
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", self.0.as_secs()))
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(ConfigDuration::from_secs(n)),
            Raw::Text(s) => ConfigDuration::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parsing() {
        let d: ConfigDuration = serde_yaml::from_str("6h").unwrap();
        assert_eq!(d.as_duration(), Duration::from_secs(6 * 3600));

        let d: ConfigDuration = serde_yaml::from_str("1h30m").unwrap();
        assert_eq!(d.as_duration(), Duration::from_secs(5400));

        let d: ConfigDuration = serde_yaml::from_str("45").unwrap();
        assert_eq!(d.as_duration(), Duration::from_secs(45));

        assert!(serde_yaml::from_str::<ConfigDuration>("6x").is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let doc = "apiVersion: pipecd.dev/v1beta1\nkind: Gateway\nspec: {}\n";
        let err = Config::from_yaml(doc).unwrap_err();
        assert!(err.to_string().contains("unknown configuration kind"));
    }

    #[test]
    fn test_control_plane_kind_rejected_by_agent() {
        let doc = "apiVersion: pipecd.dev/v1beta1\nkind: ControlPlane\nspec: {}\n";
        assert!(Config::from_yaml(doc).is_err());
    }

    #[test]
    fn test_wrong_api_version_rejected() {
        let doc = "apiVersion: pipecd.dev/v2\nkind: Piped\nspec: {}\n";
        assert!(Config::from_yaml(doc).is_err());
    }
}

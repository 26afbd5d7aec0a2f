//! Per-application deployment configuration
//!
//! A deployment spec has a generic part shared by all kinds (commit matcher,
//! pipeline, trigger paths, sealed secrets, timeout) and a kind-specific
//! input section. Pipeline stages are decoded in two passes: the envelope
//! `{id, name, desc, timeout, with}` first, then `with` against the options
//! variant selected by the stage name.

use serde::{Deserialize, Deserializer, Serialize};

use super::ConfigDuration;
use crate::errors::PipedError;
use crate::model::{ApplicationKind, StageName};

const DEFAULT_DEPLOYMENT_TIMEOUT_SECS: u64 = 6 * 3600;
const DEFAULT_WAIT_APPROVAL_TIMEOUT_SECS: u64 = 6 * 3600;
const DEFAULT_ANALYSIS_QUERY_TIMEOUT_SECS: u64 = 30;

/// The deployment spec of one application, any kind.
#[derive(Debug, Clone)]
pub enum AppDeploymentSpec {
    Kubernetes(KubernetesDeploymentSpec),
    Terraform(TerraformDeploymentSpec),
    CloudRun(CloudRunDeploymentSpec),
    Lambda(LambdaDeploymentSpec),
    Ecs(EcsDeploymentSpec),
}

impl AppDeploymentSpec {
    pub fn kind(&self) -> ApplicationKind {
        match self {
            AppDeploymentSpec::Kubernetes(_) => ApplicationKind::Kubernetes,
            AppDeploymentSpec::Terraform(_) => ApplicationKind::Terraform,
            AppDeploymentSpec::CloudRun(_) => ApplicationKind::CloudRun,
            AppDeploymentSpec::Lambda(_) => ApplicationKind::Lambda,
            AppDeploymentSpec::Ecs(_) => ApplicationKind::Ecs,
        }
    }

    pub fn generic(&self) -> &GenericDeploymentSpec {
        match self {
            AppDeploymentSpec::Kubernetes(s) => &s.generic,
            AppDeploymentSpec::Terraform(s) => &s.generic,
            AppDeploymentSpec::CloudRun(s) => &s.generic,
            AppDeploymentSpec::Lambda(s) => &s.generic,
            AppDeploymentSpec::Ecs(s) => &s.generic,
        }
    }

    pub fn kubernetes(&self) -> Option<&KubernetesDeploymentSpec> {
        match self {
            AppDeploymentSpec::Kubernetes(s) => Some(s),
            _ => None,
        }
    }
}

/// Settings shared by every application kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericDeploymentSpec {
    /// Forcibly use QuickSync or Pipeline when the commit message matches
    #[serde(default)]
    pub commit_matcher: DeploymentCommitMatcher,

    /// Pipeline for deploying progressively
    #[serde(default)]
    pub pipeline: Option<DeploymentPipeline>,

    /// Sealed secrets to decrypt into the deploy source before use
    #[serde(default)]
    pub sealed_secrets: Vec<SealedSecretMapping>,

    /// Directories or files whose changes trigger a deployment.
    /// Regular expressions, evaluated against repo-relative paths.
    #[serde(default)]
    pub trigger_paths: Vec<String>,

    /// Maximum time a deployment may run before giving up. Default 6h.
    #[serde(default)]
    pub timeout: ConfigDuration,
}

impl GenericDeploymentSpec {
    pub fn validate(&mut self) -> Result<(), PipedError> {
        if self.timeout.is_zero() {
            self.timeout = ConfigDuration::from_secs(DEFAULT_DEPLOYMENT_TIMEOUT_SECS);
        }
        if let Some(pipeline) = &self.pipeline {
            for stage in &pipeline.stages {
                if let StageOptions::Analysis(opts) = &stage.options {
                    opts.validate()?;
                }
            }
        }
        Ok(())
    }

    pub fn get_stage(&self, index: usize) -> Option<&PipelineStage> {
        self.pipeline.as_ref()?.stages.get(index)
    }

    /// Whether the configured pipeline includes the given stage name.
    pub fn has_stage(&self, name: StageName) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.stages.iter().any(|s| s.name == name))
    }
}

/// Forces a plan when the commit message matches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentCommitMatcher {
    /// Perform QuickSync if the commit message matches this regular expression
    #[serde(default)]
    pub quick_sync: String,
    /// Perform the pipeline if the commit message matches this regular expression
    #[serde(default)]
    pub pipeline: String,
}

/// The ordered stage list of a progressive deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPipeline {
    pub stages: Vec<PipelineStage>,
}

/// One configured stage: envelope fields plus name-selected options
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStage {
    pub id: String,
    pub name: StageName,
    pub desc: String,
    pub timeout: ConfigDuration,
    #[serde(skip_serializing)]
    pub options: StageOptions,
}

/// Options for a stage, selected by the stage name
#[derive(Debug, Clone)]
pub enum StageOptions {
    Wait(WaitStageOptions),
    WaitApproval(WaitApprovalStageOptions),
    Analysis(AnalysisStageOptions),

    K8sSync(K8sSyncStageOptions),
    K8sPrimaryRollout(K8sPrimaryRolloutStageOptions),
    K8sCanaryRollout(K8sCanaryRolloutStageOptions),
    K8sCanaryClean(K8sCanaryCleanStageOptions),
    K8sBaselineRollout(K8sBaselineRolloutStageOptions),
    K8sBaselineClean(K8sBaselineCleanStageOptions),
    K8sTrafficRouting(K8sTrafficRoutingStageOptions),

    TerraformSync(TerraformSyncStageOptions),
    TerraformPlan(TerraformPlanStageOptions),
    TerraformApply(TerraformApplyStageOptions),

    CloudRunSync(CloudRunSyncStageOptions),
    CloudRunPromote(CloudRunPromoteStageOptions),

    LambdaSync(LambdaSyncStageOptions),
    LambdaCanaryRollout(LambdaCanaryRolloutStageOptions),
    LambdaPromote(LambdaPromoteStageOptions),

    EcsSync(EcsSyncStageOptions),
}

#[derive(Debug, Deserialize)]
struct StageEnvelope {
    #[serde(default)]
    id: String,
    name: StageName,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    timeout: ConfigDuration,
    #[serde(default)]
    with: Option<serde_yaml::Value>,
}

fn decode_with<T: serde::de::DeserializeOwned + Default, E: serde::de::Error>(
    with: Option<serde_yaml::Value>,
) -> Result<T, E> {
    match with {
        Some(value) => serde_yaml::from_value(value).map_err(E::custom),
        None => Ok(T::default()),
    }
}

impl<'de> Deserialize<'de> for PipelineStage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let envelope = StageEnvelope::deserialize(deserializer)?;
        let options = match envelope.name {
            StageName::Wait => StageOptions::Wait(decode_with(envelope.with)?),
            StageName::WaitApproval => {
                let mut opts: WaitApprovalStageOptions = decode_with(envelope.with)?;
                if opts.timeout.is_zero() {
                    opts.timeout = ConfigDuration::from_secs(DEFAULT_WAIT_APPROVAL_TIMEOUT_SECS);
                }
                StageOptions::WaitApproval(opts)
            }
            StageName::Analysis => {
                let mut opts: AnalysisStageOptions = decode_with(envelope.with)?;
                for metric in &mut opts.metrics {
                    if metric.timeout.is_zero() {
                        metric.timeout =
                            ConfigDuration::from_secs(DEFAULT_ANALYSIS_QUERY_TIMEOUT_SECS);
                    }
                }
                StageOptions::Analysis(opts)
            }

            StageName::K8sSync => StageOptions::K8sSync(decode_with(envelope.with)?),
            StageName::K8sPrimaryRollout => {
                StageOptions::K8sPrimaryRollout(decode_with(envelope.with)?)
            }
            StageName::K8sCanaryRollout => {
                StageOptions::K8sCanaryRollout(decode_with(envelope.with)?)
            }
            StageName::K8sCanaryClean => StageOptions::K8sCanaryClean(decode_with(envelope.with)?),
            StageName::K8sBaselineRollout => {
                StageOptions::K8sBaselineRollout(decode_with(envelope.with)?)
            }
            StageName::K8sBaselineClean => {
                StageOptions::K8sBaselineClean(decode_with(envelope.with)?)
            }
            StageName::K8sTrafficRouting => {
                StageOptions::K8sTrafficRouting(decode_with(envelope.with)?)
            }

            StageName::TerraformSync => StageOptions::TerraformSync(decode_with(envelope.with)?),
            StageName::TerraformPlan => StageOptions::TerraformPlan(decode_with(envelope.with)?),
            StageName::TerraformApply => StageOptions::TerraformApply(decode_with(envelope.with)?),

            StageName::CloudRunSync => StageOptions::CloudRunSync(decode_with(envelope.with)?),
            StageName::CloudRunPromote => {
                StageOptions::CloudRunPromote(decode_with(envelope.with)?)
            }

            StageName::LambdaSync => StageOptions::LambdaSync(decode_with(envelope.with)?),
            StageName::LambdaCanaryRollout => {
                StageOptions::LambdaCanaryRollout(decode_with(envelope.with)?)
            }
            StageName::LambdaPromote => StageOptions::LambdaPromote(decode_with(envelope.with)?),

            StageName::EcsSync => StageOptions::EcsSync(decode_with(envelope.with)?),

            StageName::Rollback => {
                return Err(D::Error::custom(
                    "ROLLBACK cannot be declared in a pipeline; it is injected by the agent",
                ))
            }
        };

        Ok(PipelineStage {
            id: envelope.id,
            name: envelope.name,
            desc: envelope.desc,
            timeout: envelope.timeout,
            options,
        })
    }
}

// ============================ STAGE OPTIONS ============================= //

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitStageOptions {
    #[serde(default)]
    pub duration: ConfigDuration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitApprovalStageOptions {
    /// Maximum time to wait before giving up. Defaults to 6h.
    #[serde(default)]
    pub timeout: ConfigDuration,
    /// Users allowed to approve; empty allows anyone
    #[serde(default)]
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStageOptions {
    /// How long the analysis runs
    #[serde(default)]
    pub duration: ConfigDuration,
    #[serde(default)]
    pub metrics: Vec<AnalysisMetrics>,
    #[serde(default)]
    pub logs: Vec<AnalysisLog>,
    #[serde(default)]
    pub https: Vec<AnalysisHttp>,
    #[serde(default)]
    pub dynamic: AnalysisDynamic,
}

impl AnalysisStageOptions {
    pub fn validate(&self) -> Result<(), PipedError> {
        if self.duration.is_zero() {
            return Err(PipedError::ConfigError(
                "the ANALYSIS stage requires duration field".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetrics {
    pub query: String,
    /// Expected value range, e.g. "< 0.05"
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub interval: ConfigDuration,
    /// Per-query timeout. Defaults to 30s.
    #[serde(default)]
    pub timeout: ConfigDuration,
    /// Consecutive bad samples tolerated before the stage fails.
    /// Defaults to 1: fail on the first bad sample.
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    #[serde(default)]
    pub provider: String,
}

fn default_failure_limit() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisLog {
    pub query: String,
    #[serde(default)]
    pub interval: ConfigDuration,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    #[serde(default)]
    pub provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisHttp {
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub expected_code: u16,
    #[serde(default)]
    pub interval: ConfigDuration,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
}

/// Queries resolved at runtime rather than fixed in configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDynamic {
    #[serde(default)]
    pub metrics: Vec<AnalysisMetrics>,
    #[serde(default)]
    pub logs: Vec<AnalysisLog>,
    #[serde(default)]
    pub https: Vec<AnalysisHttp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sSyncStageOptions {
    /// Remove resources no longer present in Git
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sPrimaryRolloutStageOptions {
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sCanaryRolloutStageOptions {
    /// How many canary replicas to run, absolute or percentage of primary
    #[serde(default)]
    pub replicas: Replicas,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sCanaryCleanStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sBaselineRolloutStageOptions {
    #[serde(default)]
    pub replicas: Replicas,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sBaselineCleanStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sTrafficRoutingStageOptions {
    /// Route all traffic to "primary" or "canary"
    #[serde(default)]
    pub all: String,
    #[serde(default)]
    pub primary: u32,
    #[serde(default)]
    pub canary: u32,
    #[serde(default)]
    pub baseline: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformSyncStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformPlanStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformApplyStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunSyncStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunPromoteStageOptions {
    /// Percent of traffic to shift to the new revision
    #[serde(default)]
    pub percent: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaSyncStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaCanaryRolloutStageOptions {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaPromoteStageOptions {
    /// Percent of traffic to shift to the new version
    #[serde(default)]
    pub percent: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsSyncStageOptions {}

/// A replica count, either absolute (`3`) or a percentage (`"50%"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicas {
    pub number: u32,
    pub is_percentage: bool,
}

impl Default for Replicas {
    fn default() -> Self {
        Replicas {
            number: 1,
            is_percentage: false,
        }
    }
}

impl Replicas {
    /// Resolve against the primary replica count.
    pub fn calculate(&self, primary: u32) -> u32 {
        if !self.is_percentage {
            return self.number;
        }
        let num = (primary as f64 * self.number as f64 / 100.0).ceil() as u32;
        num.max(1)
    }
}

impl Serialize for Replicas {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_percentage {
            serializer.serialize_str(&format!("{}%", self.number))
        } else {
            serializer.serialize_u32(self.number)
        }
    }
}

impl<'de> Deserialize<'de> for Replicas {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Replicas {
                number: n,
                is_percentage: false,
            }),
            Raw::Text(s) => {
                let (num, pct) = match s.strip_suffix('%') {
                    Some(rest) => (rest, true),
                    None => (s.as_str(), false),
                };
                let number: u32 = num
                    .trim()
                    .parse()
                    .map_err(|_| serde::de::Error::custom(format!("invalid replicas: {}", s)))?;
                Ok(Replicas {
                    number,
                    is_percentage: pct,
                })
            }
        }
    }
}

// ============================= KIND SPECS =============================== //

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesDeploymentSpec {
    #[serde(flatten)]
    pub generic: GenericDeploymentSpec,
    #[serde(default)]
    pub input: KubernetesDeploymentInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesDeploymentInput {
    /// Manifest files relative to the application directory;
    /// empty loads every YAML file in the directory
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub kubectl_version: String,
    #[serde(default)]
    pub kustomize_version: String,
    #[serde(default)]
    pub helm_version: String,
    /// Run the rollback stage automatically when the pipeline fails
    #[serde(default = "default_auto_rollback")]
    pub auto_rollback: bool,
}

fn default_auto_rollback() -> bool {
    true
}

impl Default for KubernetesDeploymentInput {
    fn default() -> Self {
        Self {
            manifests: Vec::new(),
            namespace: String::new(),
            kubectl_version: String::new(),
            kustomize_version: String::new(),
            helm_version: String::new(),
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformDeploymentSpec {
    #[serde(flatten)]
    pub generic: GenericDeploymentSpec,
    #[serde(default)]
    pub input: TerraformDeploymentInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformDeploymentInput {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub terraform_version: String,
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunDeploymentSpec {
    #[serde(flatten)]
    pub generic: GenericDeploymentSpec,
    #[serde(default)]
    pub input: CloudRunDeploymentInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunDeploymentInput {
    #[serde(default)]
    pub service_manifest_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaDeploymentSpec {
    #[serde(flatten)]
    pub generic: GenericDeploymentSpec,
    #[serde(default)]
    pub input: LambdaDeploymentInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaDeploymentInput {
    #[serde(default)]
    pub function_manifest_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsDeploymentSpec {
    #[serde(flatten)]
    pub generic: GenericDeploymentSpec,
    #[serde(default)]
    pub input: EcsDeploymentInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsDeploymentInput {
    #[serde(default)]
    pub task_definition_file: String,
    #[serde(default)]
    pub service_definition_file: String,
}

/// Maps a sealed secret file in Git to its decrypted location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecretMapping {
    /// Relative path from the application directory to the sealed file
    pub path: String,
    /// Filename for the decrypted secret; empty keeps the sealed name
    #[serde(default)]
    pub out_filename: String,
    /// Directory for the decrypted secret; empty keeps the sealed directory
    #[serde(default)]
    pub out_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const K8S_APP: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
        with:
          replicas: 50%
      - name: ANALYSIS
        with:
          duration: 10m
          metrics:
            - query: grpc_error_rate
              expected: "< 0.05"
              interval: 1m
              failureLimit: 3
      - name: WAIT_APPROVAL
        with:
          approvers:
            - alice
      - name: K8S_PRIMARY_ROLLOUT
      - name: K8S_CANARY_CLEAN
"#;

    #[test]
    fn test_two_pass_stage_decode() {
        let spec = Config::from_yaml(K8S_APP).unwrap().app_spec().unwrap();
        assert_eq!(spec.kind(), ApplicationKind::Kubernetes);

        let pipeline = spec.generic().pipeline.as_ref().unwrap();
        assert_eq!(pipeline.stages.len(), 5);

        match &pipeline.stages[0].options {
            StageOptions::K8sCanaryRollout(opts) => {
                assert!(opts.replicas.is_percentage);
                assert_eq!(opts.replicas.number, 50);
            }
            other => panic!("unexpected options: {:?}", other),
        }

        match &pipeline.stages[1].options {
            StageOptions::Analysis(opts) => {
                assert_eq!(opts.duration.as_duration().as_secs(), 600);
                assert_eq!(opts.metrics[0].failure_limit, 3);
                // Per-query timeout defaults to 30s.
                assert_eq!(opts.metrics[0].timeout.as_duration().as_secs(), 30);
            }
            other => panic!("unexpected options: {:?}", other),
        }

        match &pipeline.stages[2].options {
            StageOptions::WaitApproval(opts) => {
                // Defaulted to 6h when unset.
                assert_eq!(opts.timeout.as_duration().as_secs(), 6 * 3600);
                assert_eq!(opts.approvers, vec!["alice".to_string()]);
            }
            other => panic!("unexpected options: {:?}", other),
        }
    }

    #[test]
    fn test_deployment_timeout_default() {
        let spec = Config::from_yaml(K8S_APP).unwrap().app_spec().unwrap();
        assert_eq!(spec.generic().timeout.as_duration().as_secs(), 6 * 3600);
    }

    #[test]
    fn test_unknown_stage_name_rejected() {
        let doc = K8S_APP.replace("K8S_PRIMARY_ROLLOUT", "K8S_BLUE_GREEN");
        assert!(Config::from_yaml(&doc).is_err());
    }

    #[test]
    fn test_rollback_not_declarable() {
        let doc = K8S_APP.replace("K8S_PRIMARY_ROLLOUT", "ROLLBACK");
        assert!(Config::from_yaml(&doc).is_err());
    }

    #[test]
    fn test_analysis_requires_duration() {
        let doc = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: ANALYSIS
"#;
        let err = Config::from_yaml(doc).unwrap_err();
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn test_replicas_calculation() {
        let pct = Replicas {
            number: 50,
            is_percentage: true,
        };
        assert_eq!(pct.calculate(4), 2);
        assert_eq!(pct.calculate(1), 1);

        let abs = Replicas {
            number: 3,
            is_percentage: false,
        };
        assert_eq!(abs.calculate(10), 3);
    }

    #[test]
    fn test_has_stage() {
        let spec = Config::from_yaml(K8S_APP).unwrap().app_spec().unwrap();
        assert!(spec.generic().has_stage(StageName::WaitApproval));
        assert!(!spec.generic().has_stage(StageName::K8sBaselineRollout));
    }
}

//! Deployment planners
//!
//! A planner decides the stage pipeline for a newly created deployment:
//! QuickSync (apply everything in one stage) or the configured progressive
//! pipeline. Planners are pure given their input; persistence of the plan
//! is the controller's job.

pub mod generic;
pub mod kubernetes;

use std::collections::HashMap;
use std::sync::Arc;

use crate::cloudprovider::Manifest;
use crate::config::AppDeploymentSpec;
use crate::errors::PipedError;
use crate::model::{Application, ApplicationKind, Deployment, Stage, StageName};

/// Everything a planner may look at. Output depends only on this value.
pub struct PlannerInput {
    pub deployment: Deployment,
    pub application: Application,
    pub app_spec: AppDeploymentSpec,
    /// Empty until the application has deployed successfully once
    pub most_recent_successful_commit_hash: String,
    /// Manifests at the most recent successful commit; empty when unknown
    pub old_manifests: Vec<Manifest>,
    /// Manifests at the triggered commit
    pub new_manifests: Vec<Manifest>,
}

/// The provisional stage list plus a human description of the decision.
#[derive(Debug, Clone)]
pub struct Plan {
    pub summary: String,
    pub stages: Vec<Stage>,
}

pub trait Planner: Send + Sync {
    fn plan(&self, input: &PlannerInput) -> Result<Plan, PipedError>;
}

/// ApplicationKind -> planner, built explicitly at process start.
pub struct PlannerRegistry {
    planners: HashMap<ApplicationKind, Arc<dyn Planner>>,
}

impl PlannerRegistry {
    pub fn new() -> Self {
        Self {
            planners: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: ApplicationKind, planner: Arc<dyn Planner>) {
        self.planners.insert(kind, planner);
    }

    pub fn get(&self, kind: ApplicationKind) -> Option<Arc<dyn Planner>> {
        self.planners.get(&kind).cloned()
    }

    /// The registry with every built-in planner registered.
    pub fn default_registry() -> Self {
        let mut registry = Self::new();
        registry.register(
            ApplicationKind::Kubernetes,
            Arc::new(kubernetes::KubernetesPlanner::new()),
        );
        for kind in [
            ApplicationKind::Terraform,
            ApplicationKind::CloudRun,
            ApplicationKind::Lambda,
            ApplicationKind::Ecs,
        ] {
            registry.register(kind, Arc::new(generic::GenericPlanner::new(kind)));
        }
        registry
    }
}

impl Default for PlannerRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}

/// Build the single-stage QuickSync pipeline, appending the hidden
/// rollback stage when the kind supports automatic rollback.
pub fn build_quick_sync_stages(kind: ApplicationKind, auto_rollback: bool) -> Vec<Stage> {
    let mut stages = Vec::new();
    let mut sync = Stage::new("stage-0", StageName::quick_sync_for(kind));
    sync.index = 0;
    stages.push(sync);
    if auto_rollback {
        stages.push(rollback_stage());
    }
    stages
}

/// Build the configured progressive pipeline, chaining stages so each one
/// requires its predecessor.
pub fn build_progressive_stages(
    pipeline: &crate::config::DeploymentPipeline,
    auto_rollback: bool,
) -> Vec<Stage> {
    let mut stages: Vec<Stage> = Vec::with_capacity(pipeline.stages.len());
    for (i, cfg) in pipeline.stages.iter().enumerate() {
        let id = if cfg.id.is_empty() {
            format!("stage-{}", i)
        } else {
            cfg.id.clone()
        };
        let mut stage = Stage::new(id, cfg.name);
        stage.desc = cfg.desc.clone();
        stage.index = i as u32;
        if i > 0 {
            stage.requires = vec![stages[i - 1].id.clone()];
        }
        stages.push(stage);
    }
    if auto_rollback {
        stages.push(rollback_stage());
    }
    stages
}

fn rollback_stage() -> Stage {
    let mut stage = Stage::new("stage-rollback", StageName::Rollback);
    stage.predefined = true;
    stage.visible = false;
    stage
}

/// Whether the commit message matches the given forcing pattern.
pub fn matches_commit_pattern(pattern: &str, message: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    regex::Regex::new(pattern)
        .map(|re| re.is_match(message))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_progressive_stages_chain_predecessors() {
        let doc = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
      - name: WAIT_APPROVAL
      - name: K8S_PRIMARY_ROLLOUT
      - name: K8S_CANARY_CLEAN
"#;
        let spec = Config::from_yaml(doc).unwrap().app_spec().unwrap();
        let pipeline = spec.generic().pipeline.clone().unwrap();
        let stages = build_progressive_stages(&pipeline, true);

        assert_eq!(stages.len(), 5);
        assert!(stages[0].requires.is_empty());
        assert_eq!(stages[1].requires, vec!["stage-0".to_string()]);
        assert_eq!(stages[3].requires, vec!["stage-2".to_string()]);

        let rollback = stages.last().unwrap();
        assert_eq!(rollback.name, StageName::Rollback);
        assert!(rollback.predefined);
        assert!(!rollback.visible);
    }

    #[test]
    fn test_quick_sync_stages() {
        let stages = build_quick_sync_stages(ApplicationKind::Kubernetes, false);
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, StageName::K8sSync);

        let stages = build_quick_sync_stages(ApplicationKind::Terraform, true);
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name, StageName::TerraformSync);
        assert_eq!(stages[1].name, StageName::Rollback);
    }

    #[test]
    fn test_commit_pattern_matching() {
        assert!(matches_commit_pattern(r"^\[QUICK\]", "[QUICK] fix typo"));
        assert!(!matches_commit_pattern(r"^\[QUICK\]", "fix typo"));
        assert!(!matches_commit_pattern("", "anything"));
    }
}

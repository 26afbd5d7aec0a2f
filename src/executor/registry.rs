//! Executor registry
//!
//! A two-level mapping (ApplicationKind, StageName) -> executor, built once
//! at process start before any deployment is scheduled. A lookup miss at
//! execution time fails the stage with an "unsupported stage" reason.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    analysis::AnalysisExecutor, cloudrun::CloudRunExecutor, ecs::EcsExecutor,
    kubernetes::KubernetesExecutor, lambda::LambdaExecutor, terraform::TerraformExecutor,
    wait::WaitExecutor, waitapproval::WaitApprovalExecutor, Executor,
};
use crate::model::{ApplicationKind, StageName};

pub struct ExecutorRegistry {
    executors: HashMap<(ApplicationKind, StageName), Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        kind: ApplicationKind,
        stage: StageName,
        executor: Arc<dyn Executor>,
    ) {
        self.executors.insert((kind, stage), executor);
    }

    pub fn get(&self, kind: ApplicationKind, stage: StageName) -> Option<Arc<dyn Executor>> {
        self.executors.get(&(kind, stage)).cloned()
    }

    /// The registry with every built-in executor registered.
    pub fn default_registry() -> Self {
        let mut registry = Self::new();

        let all_kinds = [
            ApplicationKind::Kubernetes,
            ApplicationKind::Terraform,
            ApplicationKind::CloudRun,
            ApplicationKind::Lambda,
            ApplicationKind::Ecs,
        ];

        // The generic stages are available to every kind.
        let wait: Arc<dyn Executor> = Arc::new(WaitExecutor::new());
        let approval: Arc<dyn Executor> = Arc::new(WaitApprovalExecutor::new());
        let analysis: Arc<dyn Executor> = Arc::new(AnalysisExecutor::new());
        for kind in all_kinds {
            registry.register(kind, StageName::Wait, wait.clone());
            registry.register(kind, StageName::WaitApproval, approval.clone());
            registry.register(kind, StageName::Analysis, analysis.clone());
        }

        let kubernetes: Arc<dyn Executor> = Arc::new(KubernetesExecutor::new());
        for stage in [
            StageName::K8sSync,
            StageName::K8sPrimaryRollout,
            StageName::K8sCanaryRollout,
            StageName::K8sCanaryClean,
            StageName::K8sBaselineRollout,
            StageName::K8sBaselineClean,
            StageName::K8sTrafficRouting,
            StageName::Rollback,
        ] {
            registry.register(ApplicationKind::Kubernetes, stage, kubernetes.clone());
        }

        let terraform: Arc<dyn Executor> = Arc::new(TerraformExecutor::new());
        for stage in [
            StageName::TerraformSync,
            StageName::TerraformPlan,
            StageName::TerraformApply,
            StageName::Rollback,
        ] {
            registry.register(ApplicationKind::Terraform, stage, terraform.clone());
        }

        let cloudrun: Arc<dyn Executor> = Arc::new(CloudRunExecutor::new());
        for stage in [
            StageName::CloudRunSync,
            StageName::CloudRunPromote,
            StageName::Rollback,
        ] {
            registry.register(ApplicationKind::CloudRun, stage, cloudrun.clone());
        }

        let lambda: Arc<dyn Executor> = Arc::new(LambdaExecutor::new());
        for stage in [
            StageName::LambdaSync,
            StageName::LambdaCanaryRollout,
            StageName::LambdaPromote,
            StageName::Rollback,
        ] {
            registry.register(ApplicationKind::Lambda, stage, lambda.clone());
        }

        let ecs: Arc<dyn Executor> = Arc::new(EcsExecutor::new());
        for stage in [StageName::EcsSync, StageName::Rollback] {
            registry.register(ApplicationKind::Ecs, stage, ecs.clone());
        }

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_coverage() {
        let registry = ExecutorRegistry::default_registry();

        assert!(registry
            .get(ApplicationKind::Kubernetes, StageName::K8sPrimaryRollout)
            .is_some());
        assert!(registry
            .get(ApplicationKind::Terraform, StageName::TerraformPlan)
            .is_some());
        assert!(registry
            .get(ApplicationKind::Ecs, StageName::Wait)
            .is_some());

        // A kubernetes stage is not available to an ecs application.
        assert!(registry
            .get(ApplicationKind::Ecs, StageName::K8sPrimaryRollout)
            .is_none());
    }
}

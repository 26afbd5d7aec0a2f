//! Planner for the quick-sync-first application kinds
//!
//! Terraform, Cloud Run, Lambda and ECS deploy by applying their
//! definitions; the progressive pipeline is used only when one is
//! configured and the definitions actually changed (or the commit message
//! forces it).

use super::{
    build_progressive_stages, build_quick_sync_stages, matches_commit_pattern, Plan, Planner,
    PlannerInput,
};
use crate::cloudprovider::diff;
use crate::errors::PipedError;
use crate::model::ApplicationKind;

pub struct GenericPlanner {
    kind: ApplicationKind,
}

impl GenericPlanner {
    pub fn new(kind: ApplicationKind) -> Self {
        Self { kind }
    }

    fn quick_sync(&self, summary: String) -> Plan {
        Plan {
            summary,
            stages: build_quick_sync_stages(self.kind, true),
        }
    }
}

impl Planner for GenericPlanner {
    fn plan(&self, input: &PlannerInput) -> Result<Plan, PipedError> {
        if input.most_recent_successful_commit_hash.is_empty() {
            return Ok(self.quick_sync(
                "Apply all manifests because it was unable to find the most recent successful commit."
                    .to_string(),
            ));
        }

        let message = &input.deployment.trigger.commit.message;
        let matcher = &input.app_spec.generic().commit_matcher;
        if matches_commit_pattern(&matcher.quick_sync, message) {
            return Ok(self.quick_sync(format!(
                "Apply all manifests because the commit message matched {}.",
                matcher.quick_sync
            )));
        }

        let pipeline = match &input.app_spec.generic().pipeline {
            Some(pipeline) => pipeline,
            None => return Ok(self.quick_sync("Apply all manifests".to_string())),
        };

        let forced = matches_commit_pattern(&matcher.pipeline, message);
        let changed = definitions_changed(input);
        if forced || changed {
            let summary = if forced {
                format!(
                    "Progressive deployment because the commit message matched {}.",
                    matcher.pipeline
                )
            } else {
                "Progressive deployment because the definitions were changed.".to_string()
            };
            return Ok(Plan {
                summary,
                stages: build_progressive_stages(pipeline, true),
            });
        }

        Ok(self.quick_sync("Apply all manifests".to_string()))
    }
}

fn definitions_changed(input: &PlannerInput) -> bool {
    if input.old_manifests.len() != input.new_manifests.len() {
        return true;
    }
    for new in &input.new_manifests {
        match input.old_manifests.iter().find(|old| old.key == new.key) {
            Some(old) => {
                if !diff(old, new, None).is_empty() {
                    return true;
                }
            }
            None => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::{Manifest, ResourceKey};
    use crate::config::Config;
    use crate::model::{
        Application, ApplicationGitPath, Deployment, DeploymentStatus, DeploymentTrigger,
        StageName,
    };
    use chrono::Utc;

    fn module(content: &str) -> Manifest {
        Manifest::new(
            ResourceKey::new("terraform.io", "Module", "", "main.tf"),
            serde_json::json!({ "content": content }),
        )
    }

    fn input(last_commit: &str, olds: Vec<Manifest>, news: Vec<Manifest>) -> PlannerInput {
        let now = Utc::now();
        PlannerInput {
            deployment: Deployment {
                id: "d-1".to_string(),
                application_id: "app-1".to_string(),
                application_name: "app".to_string(),
                env_id: "env-1".to_string(),
                kind: ApplicationKind::Terraform,
                cloud_provider: "terraform-default".to_string(),
                trigger: DeploymentTrigger::default(),
                status: DeploymentStatus::Pending,
                status_reason: String::new(),
                stages: Vec::new(),
                running_commit_hash: String::new(),
                summary: String::new(),
                metadata: Default::default(),
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
            application: Application {
                id: "app-1".to_string(),
                name: "app".to_string(),
                env_id: "env-1".to_string(),
                kind: ApplicationKind::Terraform,
                git_path: ApplicationGitPath::default(),
                cloud_provider: "terraform-default".to_string(),
                disabled: false,
                most_recent_successful_commit_hash: last_commit.to_string(),
                sync_state: None,
            },
            app_spec: crate::config::AppDeploymentSpec::Terraform(Default::default()),
            most_recent_successful_commit_hash: last_commit.to_string(),
            old_manifests: olds,
            new_manifests: news,
        }
    }

    #[test]
    fn test_first_deployment_is_quick_sync() {
        let planner = GenericPlanner::new(ApplicationKind::Terraform);
        let plan = planner.plan(&input("", vec![], vec![module("a")])).unwrap();
        assert_eq!(plan.stages[0].name, StageName::TerraformSync);
        assert!(plan.summary.contains("unable to find the most recent successful commit"));
    }

    #[test]
    fn test_changed_definitions_use_pipeline_when_configured() {
        let doc = r#"
apiVersion: pipecd.dev/v1beta1
kind: TerraformApp
spec:
  pipeline:
    stages:
      - name: TERRAFORM_PLAN
      - name: WAIT_APPROVAL
      - name: TERRAFORM_APPLY
"#;
        let spec = Config::from_yaml(doc).unwrap().app_spec().unwrap();
        let mut in_ = input("abc", vec![module("a")], vec![module("b")]);
        in_.app_spec = spec;

        let planner = GenericPlanner::new(ApplicationKind::Terraform);
        let plan = planner.plan(&in_).unwrap();
        assert_eq!(plan.stages[0].name, StageName::TerraformPlan);
        assert_eq!(plan.stages[2].name, StageName::TerraformApply);
    }

    #[test]
    fn test_unchanged_definitions_quick_sync() {
        let planner = GenericPlanner::new(ApplicationKind::Terraform);
        let plan = planner
            .plan(&input("abc", vec![module("a")], vec![module("a")]))
            .unwrap();
        assert_eq!(plan.stages[0].name, StageName::TerraformSync);
        assert_eq!(plan.summary, "Apply all manifests");
    }
}

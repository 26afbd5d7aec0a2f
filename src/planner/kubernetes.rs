//! Kubernetes planner

use tracing::debug;

use super::{
    build_progressive_stages, build_quick_sync_stages, matches_commit_pattern, Plan, Planner,
    PlannerInput,
};
use crate::cloudprovider::{diff, DiffResultList, Manifest};
use crate::errors::PipedError;
use crate::model::ApplicationKind;

/// Marker in a commit message that forces a rollback-style quick sync.
pub const ROLLBACK_MARKER: &str = "/pipecd rollback ";

const CONTAINER_IMAGE_QUERY: &str = r"^spec.template.spec.containers.\[\d+\].image$";
const REPLICAS_QUERY: &str = r"^spec.replicas$";

pub struct KubernetesPlanner {}

impl KubernetesPlanner {
    pub fn new() -> Self {
        Self {}
    }

    fn auto_rollback(input: &PlannerInput) -> bool {
        input
            .app_spec
            .kubernetes()
            .map(|s| s.input.auto_rollback)
            .unwrap_or(true)
    }

    fn quick_sync(input: &PlannerInput, summary: String) -> Plan {
        Plan {
            summary,
            stages: build_quick_sync_stages(
                ApplicationKind::Kubernetes,
                Self::auto_rollback(input),
            ),
        }
    }

    fn progressive(input: &PlannerInput, summary: String) -> Plan {
        match &input.app_spec.generic().pipeline {
            Some(pipeline) => Plan {
                summary,
                stages: build_progressive_stages(pipeline, Self::auto_rollback(input)),
            },
            // Progressive was decided but no pipeline is configured;
            // the only executable plan is applying everything.
            None => Self::quick_sync(input, summary),
        }
    }
}

impl Default for KubernetesPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Planner for KubernetesPlanner {
    fn plan(&self, input: &PlannerInput) -> Result<Plan, PipedError> {
        // This is the first time to deploy this application or the last
        // successful commit could not be determined. Apply all manifests.
        if input.most_recent_successful_commit_hash.is_empty() {
            return Ok(Self::quick_sync(
                input,
                "Apply all manifests because it was unable to find the most recent successful commit."
                    .to_string(),
            ));
        }

        let message = &input.deployment.trigger.commit.message;

        // A revert commit applies the primary directly to roll back.
        if message.contains(ROLLBACK_MARKER) {
            return Ok(Self::quick_sync(
                input,
                format!(
                    "Rollback from commit {}.",
                    input.most_recent_successful_commit_hash
                ),
            ));
        }

        let matcher = &input.app_spec.generic().commit_matcher;
        if matches_commit_pattern(&matcher.quick_sync, message) {
            return Ok(Self::quick_sync(
                input,
                format!(
                    "Apply all manifests because the commit message matched {}.",
                    matcher.quick_sync
                ),
            ));
        }
        if matches_commit_pattern(&matcher.pipeline, message) {
            return Ok(Self::progressive(
                input,
                format!(
                    "Progressive deployment because the commit message matched {}.",
                    matcher.pipeline
                ),
            ));
        }

        let (progressive, summary) = decide_strategy(&input.old_manifests, &input.new_manifests);
        debug!(
            "Planned {} for {}: {}",
            if progressive { "progressive" } else { "quick sync" },
            input.deployment.id,
            summary
        );

        if progressive {
            return Ok(Self::progressive(input, summary));
        }
        Ok(Self::quick_sync(input, summary))
    }
}

/// Decide between QuickSync and Progressive by comparing the workloads.
pub fn decide_strategy(olds: &[Manifest], news: &[Manifest]) -> (bool, String) {
    let Some(old_workload) = find_workload(olds) else {
        return (
            false,
            "Apply all manifests because it was unable to find the currently running workloads."
                .to_string(),
        );
    };
    let Some(new_workload) = find_workload(news) else {
        return (
            false,
            "Apply all manifests because it was unable to find workloads in the new manifests."
                .to_string(),
        );
    };

    // A touched pod template means the change needs the progressive pipeline.
    let workload_diffs = diff(old_workload, new_workload, Some("spec"));
    let template_diffs = workload_diffs.find_by_prefix("spec.template");
    if !template_diffs.is_empty() {
        if let Some(summary) = check_image_change(&workload_diffs) {
            return (true, summary);
        }
        return (
            true,
            format!(
                "Progressive deployment because pod template of workload {} was changed.",
                new_workload.key.name
            ),
        );
    }

    if let Some(summary) = check_replicas_change(&workload_diffs) {
        return (false, summary);
    }

    (false, "Apply all manifests".to_string())
}

fn find_workload(manifests: &[Manifest]) -> Option<&Manifest> {
    manifests.iter().find(|m| m.key.is_deployment())
}

fn check_image_change(diffs: &DiffResultList) -> Option<String> {
    let image_diffs = diffs.find_all(CONTAINER_IMAGE_QUERY);
    if image_diffs.is_empty() {
        return None;
    }

    let mut images = Vec::with_capacity(image_diffs.len());
    for d in image_diffs {
        let (before_name, before_tag) = parse_container_image(&d.before);
        let (after_name, after_tag) = parse_container_image(&d.after);
        if before_name == after_name {
            images.push(format!(
                "image {} from {} to {}",
                before_name, before_tag, after_tag
            ));
        } else {
            images.push(format!(
                "image {}:{} to {}:{}",
                before_name, before_tag, after_name, after_tag
            ));
        }
    }
    Some(format!(
        "Progressive deployment because of updating {}.",
        images.join(", ")
    ))
}

fn check_replicas_change(diffs: &DiffResultList) -> Option<String> {
    let d = diffs.find(REPLICAS_QUERY)?;
    Some(format!("Scale workload from {} to {}.", d.before, d.after))
}

/// Split an image reference into its short name and tag.
fn parse_container_image(image: &str) -> (String, String) {
    let (repo, tag) = match image.rsplit_once(':') {
        Some((repo, tag)) => (repo, tag.to_string()),
        None => (image, String::new()),
    };
    let name = repo.rsplit('/').next().unwrap_or(repo).to_string();
    (name, tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::ResourceKey;

    fn workload(replicas: u64, image: &str) -> Manifest {
        Manifest::new(
            ResourceKey::new("apps", "Deployment", "default", "app"),
            serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "app", "namespace": "default"},
                "spec": {
                    "replicas": replicas,
                    "template": {
                        "spec": {"containers": [{"name": "app", "image": image}]}
                    }
                }
            }),
        )
    }

    #[test]
    fn test_parse_container_image() {
        assert_eq!(
            parse_container_image("gcr.io/project/app:1.2"),
            ("app".to_string(), "1.2".to_string())
        );
        assert_eq!(
            parse_container_image("app:1.3"),
            ("app".to_string(), "1.3".to_string())
        );
        assert_eq!(
            parse_container_image("app"),
            ("app".to_string(), String::new())
        );
    }

    #[test]
    fn test_image_change_is_progressive() {
        let (progressive, summary) =
            decide_strategy(&[workload(3, "app:1.2")], &[workload(3, "app:1.3")]);
        assert!(progressive);
        assert!(summary.contains("image app from 1.2 to 1.3"));
    }

    #[test]
    fn test_scale_only_is_quick_sync() {
        let (progressive, summary) =
            decide_strategy(&[workload(3, "app:1.2")], &[workload(5, "app:1.2")]);
        assert!(!progressive);
        assert_eq!(summary, "Scale workload from 3 to 5.");
    }

    #[test]
    fn test_no_change_applies_all() {
        let (progressive, summary) =
            decide_strategy(&[workload(3, "app:1.2")], &[workload(3, "app:1.2")]);
        assert!(!progressive);
        assert_eq!(summary, "Apply all manifests");
    }

    #[test]
    fn test_missing_workload_applies_all() {
        let (progressive, summary) = decide_strategy(&[], &[workload(3, "app:1.2")]);
        assert!(!progressive);
        assert!(summary.contains("unable to find the currently running workloads"));
    }
}

//! Kubernetes stage executors

use async_trait::async_trait;
use tracing::warn;

use super::{
    apply_target, load_running_manifests, load_target_manifests, Executor, ExecutorInput,
    StageResult, StopSignal,
};
use crate::cloudprovider::{Manifest, ResourceKey};
use crate::config::{Replicas, StageOptions};
use crate::model::StageName;

/// Label distinguishing canary/baseline variants from the primary.
pub const VARIANT_LABEL: &str = "pipecd.dev/variant";

const CANARY_VARIANT: &str = "canary";
const BASELINE_VARIANT: &str = "baseline";
const PRIMARY_VARIANT: &str = "primary";

/// Metadata keys recording the variant resources to clean up later.
const CANARY_RESOURCES_KEY: &str = "canary-resources";
const BASELINE_RESOURCES_KEY: &str = "baseline-resources";

pub struct KubernetesExecutor {}

impl KubernetesExecutor {
    pub fn new() -> Self {
        Self {}
    }

    /// Roll out a scaled copy of the workload under a variant name.
    async fn ensure_variant_rollout(
        &self,
        input: &ExecutorInput,
        sig: &StopSignal,
        variant: &str,
        replicas: Replicas,
        metadata_key: &str,
        from_running: bool,
    ) -> StageResult {
        let manifests = if from_running {
            load_running_manifests(input).await
        } else {
            load_target_manifests(input).await
        };
        let manifests = match manifests {
            Ok(m) => m,
            Err(e) => {
                input.log.error(format!("Failed to load manifests: {}", e));
                return StageResult::Failure(format!("failed to load manifests: {}", e));
            }
        };

        let Some(workload) = manifests.iter().find(|m| m.key.is_deployment()) else {
            input.log.error("No workload found to roll out a variant of");
            return StageResult::Failure("no workload found in the manifests".to_string());
        };

        let primary_replicas = workload
            .field("spec.replicas")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;
        let count = replicas.calculate(primary_replicas);

        let mut variant_manifest = workload.clone();
        variant_manifest.key.name = format!("{}-{}", workload.key.name, variant);
        variant_manifest.data["metadata"]["name"] =
            serde_json::json!(variant_manifest.key.name.clone());
        variant_manifest.data["spec"]["replicas"] = serde_json::json!(count);
        variant_manifest.add_label(VARIANT_LABEL, variant);
        set_pod_label(&mut variant_manifest, VARIANT_LABEL, variant);

        if sig.signal().is_cancel() {
            return StageResult::Cancelled;
        }

        input.log.info(format!(
            "Rolling out {} workload {} with {} replicas...",
            variant, variant_manifest.key.name, count
        ));
        if let Err(e) = input
            .provider
            .apply(
                &input.application.id,
                &input.target_dir,
                &input.app_spec,
                std::slice::from_ref(&variant_manifest),
            )
            .await
        {
            input.log.error(format!("Failed to roll out {}: {}", variant, e));
            return StageResult::Failure(format!("failed to roll out {}: {}", variant, e));
        }

        // Remember the variant resource so the clean stage can delete it.
        if let Err(e) = input
            .metadata
            .set(metadata_key, &variant_manifest.key.to_string())
            .await
        {
            warn!("Failed to record {} resources: {}", variant, e);
        }

        input
            .log
            .success(format!("Successfully rolled out the {} variant", variant));
        StageResult::Success
    }

    /// Delete the variant resources recorded during rollout.
    async fn ensure_variant_clean(
        &self,
        input: &ExecutorInput,
        variant: &str,
        metadata_key: &str,
    ) -> StageResult {
        let Some(recorded) = input.metadata.get(metadata_key) else {
            input.log.info(format!(
                "No {} resources were recorded, nothing to clean",
                variant
            ));
            return StageResult::Success;
        };

        let keys: Vec<ResourceKey> = recorded
            .split(',')
            .filter_map(parse_resource_key)
            .collect();
        if keys.is_empty() {
            return StageResult::Success;
        }

        input
            .log
            .info(format!("Deleting {} {} resources...", keys.len(), variant));
        if let Err(e) = input.provider.delete(&keys).await {
            input.log.error(format!("Failed to clean {}: {}", variant, e));
            return StageResult::Failure(format!("failed to clean {}: {}", variant, e));
        }
        input
            .log
            .success(format!("Successfully cleaned the {} variant", variant));
        StageResult::Success
    }

    /// Route all traffic to one variant by pointing the service selector.
    async fn ensure_traffic_routing(&self, input: &ExecutorInput) -> StageResult {
        let target = match input.stage_config.as_ref().map(|c| &c.options) {
            Some(StageOptions::K8sTrafficRouting(opts)) if !opts.all.is_empty() => {
                opts.all.clone()
            }
            Some(StageOptions::K8sTrafficRouting(_)) => PRIMARY_VARIANT.to_string(),
            _ => PRIMARY_VARIANT.to_string(),
        };

        let manifests = match load_target_manifests(input).await {
            Ok(m) => m,
            Err(e) => return StageResult::Failure(format!("failed to load manifests: {}", e)),
        };
        let Some(service) = manifests.iter().find(|m| m.key.kind == "Service") else {
            input.log.error("No service found to route traffic with");
            return StageResult::Failure("no service found in the manifests".to_string());
        };

        let mut routed = service.clone();
        routed.data["spec"]["selector"][VARIANT_LABEL] = serde_json::json!(target);

        input
            .log
            .info(format!("Routing all traffic to the {} variant", target));
        if let Err(e) = input
            .provider
            .apply(
                &input.application.id,
                &input.target_dir,
                &input.app_spec,
                std::slice::from_ref(&routed),
            )
            .await
        {
            return StageResult::Failure(format!("failed to route traffic: {}", e));
        }
        input.log.success("Successfully updated traffic routing");
        StageResult::Success
    }

    /// Re-apply the running commit and drop any leftover variants.
    async fn ensure_rollback(&self, input: &ExecutorInput) -> StageResult {
        let result = super::rollback_to_running(input).await;
        if result != StageResult::Success {
            return result;
        }

        for (variant, key) in [
            (CANARY_VARIANT, CANARY_RESOURCES_KEY),
            (BASELINE_VARIANT, BASELINE_RESOURCES_KEY),
        ] {
            if input.metadata.get(key).is_some() {
                let clean = self.ensure_variant_clean(input, variant, key).await;
                if clean != StageResult::Success {
                    return clean;
                }
            }
        }
        StageResult::Success
    }

    fn variant_replicas(input: &ExecutorInput) -> Replicas {
        match input.stage_config.as_ref().map(|c| &c.options) {
            Some(StageOptions::K8sCanaryRollout(opts)) => opts.replicas,
            Some(StageOptions::K8sBaselineRollout(opts)) => opts.replicas,
            _ => Replicas::default(),
        }
    }
}

impl Default for KubernetesExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        match input.stage.name {
            StageName::K8sSync | StageName::K8sPrimaryRollout => apply_target(input, &sig).await,
            StageName::K8sCanaryRollout => {
                self.ensure_variant_rollout(
                    input,
                    &sig,
                    CANARY_VARIANT,
                    Self::variant_replicas(input),
                    CANARY_RESOURCES_KEY,
                    false,
                )
                .await
            }
            StageName::K8sCanaryClean => {
                self.ensure_variant_clean(input, CANARY_VARIANT, CANARY_RESOURCES_KEY)
                    .await
            }
            // The baseline runs the currently deployed version for comparison.
            StageName::K8sBaselineRollout => {
                self.ensure_variant_rollout(
                    input,
                    &sig,
                    BASELINE_VARIANT,
                    Self::variant_replicas(input),
                    BASELINE_RESOURCES_KEY,
                    true,
                )
                .await
            }
            StageName::K8sBaselineClean => {
                self.ensure_variant_clean(input, BASELINE_VARIANT, BASELINE_RESOURCES_KEY)
                    .await
            }
            StageName::K8sTrafficRouting => self.ensure_traffic_routing(input).await,
            StageName::Rollback => self.ensure_rollback(input).await,
            other => StageResult::Failure(format!(
                "unsupported stage {} for a kubernetes application",
                other
            )),
        }
    }
}

fn set_pod_label(manifest: &mut Manifest, key: &str, value: &str) {
    let labels = &mut manifest.data["spec"]["template"]["metadata"]["labels"];
    if labels.is_null() {
        *labels = serde_json::json!({});
    }
    if let Some(map) = labels.as_object_mut() {
        map.insert(key.to_string(), serde_json::json!(value));
    }
}

fn parse_resource_key(text: &str) -> Option<ResourceKey> {
    let mut parts = text.trim().splitn(4, ':');
    Some(ResourceKey {
        api_group: parts.next()?.to_string(),
        kind: parts.next()?.to_string(),
        namespace: parts.next()?.to_string(),
        name: parts.next()?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_key_round_trip() {
        let key = ResourceKey::new("apps", "Deployment", "default", "app-canary");
        assert_eq!(parse_resource_key(&key.to_string()), Some(key));

        // Core-group keys keep the empty group through the round trip.
        let key = ResourceKey::new("", "Service", "default", "app");
        assert_eq!(parse_resource_key(&key.to_string()), Some(key));
    }
}

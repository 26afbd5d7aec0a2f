//! ECS provider

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{run_tool, CloudProvider, Manifest, ResourceKey};
use crate::config::{AppDeploymentSpec, CloudProviderConfig, CloudProviderKind};
use crate::errors::PipedError;
use crate::toolregistry::ToolRegistry;

const DEFAULT_TASK_DEFINITION: &str = "taskdef.yaml";
const DEFAULT_SERVICE_DEFINITION: &str = "servicedef.yaml";

pub struct EcsProvider {
    config: CloudProviderConfig,
    tools: Arc<ToolRegistry>,
}

impl EcsProvider {
    pub fn new(config: CloudProviderConfig, tools: Arc<ToolRegistry>) -> Self {
        Self { config, tools }
    }

    fn files(app_spec: &AppDeploymentSpec) -> (String, String) {
        match app_spec {
            AppDeploymentSpec::Ecs(s) => {
                let task = if s.input.task_definition_file.is_empty() {
                    DEFAULT_TASK_DEFINITION.to_string()
                } else {
                    s.input.task_definition_file.clone()
                };
                let service = if s.input.service_definition_file.is_empty() {
                    DEFAULT_SERVICE_DEFINITION.to_string()
                } else {
                    s.input.service_definition_file.clone()
                };
                (task, service)
            }
            _ => (
                DEFAULT_TASK_DEFINITION.to_string(),
                DEFAULT_SERVICE_DEFINITION.to_string(),
            ),
        }
    }

    fn region_args<'a>(&'a self, args: &mut Vec<&'a str>) {
        if !self.config.region.is_empty() {
            args.push("--region");
            args.push(&self.config.region);
        }
    }

    async fn load_definition(
        path: &Path,
        kind: &str,
        name_field: &str,
    ) -> Result<Manifest, PipedError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            PipedError::ProviderError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)?;
        let data = serde_json::to_value(&value)?;
        let name = data
            .get(name_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipedError::ProviderError(format!(
                    "{} definition is missing {}",
                    kind, name_field
                ))
            })?
            .to_string();
        Ok(Manifest::new(
            ResourceKey::new("ecs.aws", kind, "", name),
            data,
        ))
    }
}

#[async_trait]
impl CloudProvider for EcsProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::Ecs
    }

    async fn load_manifests(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<Vec<Manifest>, PipedError> {
        let (task_file, service_file) = Self::files(app_spec);
        let task =
            Self::load_definition(&app_dir.join(task_file), "TaskDefinition", "family").await?;
        let service =
            Self::load_definition(&app_dir.join(service_file), "Service", "serviceName").await?;
        Ok(vec![task, service])
    }

    async fn apply(
        &self,
        app_id: &str,
        _app_dir: &Path,
        _app_spec: &AppDeploymentSpec,
        manifests: &[Manifest],
    ) -> Result<(), PipedError> {
        let aws = self.tools.ensure("aws", "").await?;

        let task = manifests
            .iter()
            .find(|m| m.key.kind == "TaskDefinition")
            .ok_or_else(|| PipedError::ProviderError("missing task definition".to_string()))?;
        let service = manifests
            .iter()
            .find(|m| m.key.kind == "Service")
            .ok_or_else(|| PipedError::ProviderError("missing service definition".to_string()))?;

        let task_json = serde_json::to_string(&task.data)?;
        let mut args = vec!["ecs", "register-task-definition", "--cli-input-json", task_json.as_str()];
        self.region_args(&mut args);
        info!("Registering task definition {} for {}", task.key.name, app_id);
        run_tool(&aws, None, &args, None).await?;

        let service_json = serde_json::to_string(&service.data)?;
        let mut args = vec!["ecs", "update-service", "--cli-input-json", service_json.as_str()];
        self.region_args(&mut args);
        info!("Updating service {} for {}", service.key.name, app_id);
        run_tool(&aws, None, &args, None).await?;
        Ok(())
    }
}

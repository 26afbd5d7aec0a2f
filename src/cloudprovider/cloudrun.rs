//! Cloud Run provider

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{run_tool, CloudProvider, Manifest};
use crate::config::{AppDeploymentSpec, CloudProviderConfig, CloudProviderKind};
use crate::errors::PipedError;
use crate::toolregistry::ToolRegistry;

const DEFAULT_SERVICE_MANIFEST: &str = "service.yaml";

pub struct CloudRunProvider {
    config: CloudProviderConfig,
    tools: Arc<ToolRegistry>,
}

impl CloudRunProvider {
    pub fn new(config: CloudProviderConfig, tools: Arc<ToolRegistry>) -> Self {
        Self { config, tools }
    }

    fn manifest_file(app_spec: &AppDeploymentSpec) -> &str {
        match app_spec {
            AppDeploymentSpec::CloudRun(s) if !s.input.service_manifest_file.is_empty() => {
                &s.input.service_manifest_file
            }
            _ => DEFAULT_SERVICE_MANIFEST,
        }
    }

    fn gcloud_args<'a>(&'a self, tail: &mut Vec<&'a str>) {
        if !self.config.project.is_empty() {
            tail.push("--project");
            tail.push(&self.config.project);
        }
        if !self.config.region.is_empty() {
            tail.push("--region");
            tail.push(&self.config.region);
        }
    }
}

#[async_trait]
impl CloudProvider for CloudRunProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::CloudRun
    }

    async fn load_manifests(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<Vec<Manifest>, PipedError> {
        let file = app_dir.join(Self::manifest_file(app_spec));
        let text = tokio::fs::read_to_string(&file).await.map_err(|e| {
            PipedError::ProviderError(format!("failed to read {}: {}", file.display(), e))
        })?;
        Manifest::from_yaml_multi(&text)
    }

    async fn apply(
        &self,
        app_id: &str,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
        _manifests: &[Manifest],
    ) -> Result<(), PipedError> {
        let gcloud = self.tools.ensure("gcloud", "").await?;
        let file = app_dir.join(Self::manifest_file(app_spec));
        let file = file.to_string_lossy().into_owned();

        let mut args = vec!["run", "services", "replace", file.as_str(), "--quiet"];
        self.gcloud_args(&mut args);

        info!("Replacing Cloud Run service for {}", app_id);
        run_tool(&gcloud, None, &args, None).await?;
        Ok(())
    }

    async fn promote(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
        percent: u32,
    ) -> Result<(), PipedError> {
        let gcloud = self.tools.ensure("gcloud", "").await?;
        let manifests = self.load_manifests(app_dir, app_spec).await?;
        let service = manifests
            .first()
            .ok_or_else(|| PipedError::ProviderError("empty service manifest".to_string()))?
            .key
            .name
            .clone();

        let traffic = format!("--to-latest={}", percent.min(100));
        let mut args = vec![
            "run",
            "services",
            "update-traffic",
            service.as_str(),
            traffic.as_str(),
            "--quiet",
        ];
        self.gcloud_args(&mut args);

        info!("Shifting {}% traffic to latest revision of {}", percent, service);
        run_tool(&gcloud, None, &args, None).await?;
        Ok(())
    }
}

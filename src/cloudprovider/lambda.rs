//! Lambda provider

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{run_tool, CloudProvider, Manifest, ResourceKey};
use crate::config::{AppDeploymentSpec, CloudProviderConfig, CloudProviderKind};
use crate::errors::PipedError;
use crate::toolregistry::ToolRegistry;

const DEFAULT_FUNCTION_MANIFEST: &str = "function.yaml";

pub struct LambdaProvider {
    config: CloudProviderConfig,
    tools: Arc<ToolRegistry>,
}

impl LambdaProvider {
    pub fn new(config: CloudProviderConfig, tools: Arc<ToolRegistry>) -> Self {
        Self { config, tools }
    }

    fn manifest_file(app_spec: &AppDeploymentSpec) -> &str {
        match app_spec {
            AppDeploymentSpec::Lambda(s) if !s.input.function_manifest_file.is_empty() => {
                &s.input.function_manifest_file
            }
            _ => DEFAULT_FUNCTION_MANIFEST,
        }
    }

    fn region_args<'a>(&'a self, args: &mut Vec<&'a str>) {
        if !self.config.region.is_empty() {
            args.push("--region");
            args.push(&self.config.region);
        }
    }
}

#[async_trait]
impl CloudProvider for LambdaProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::Lambda
    }

    /// The function manifest is `{name, image, ...}`; it is keyed as a
    /// Function resource so the shared diff works across commits.
    async fn load_manifests(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<Vec<Manifest>, PipedError> {
        let file = app_dir.join(Self::manifest_file(app_spec));
        let text = tokio::fs::read_to_string(&file).await.map_err(|e| {
            PipedError::ProviderError(format!("failed to read {}: {}", file.display(), e))
        })?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)?;
        let data = serde_json::to_value(&value)?;
        let name = data
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipedError::ProviderError("function manifest is missing name".to_string())
            })?
            .to_string();

        Ok(vec![Manifest::new(
            ResourceKey::new("lambda.aws", "Function", "", name),
            data,
        )])
    }

    async fn apply(
        &self,
        app_id: &str,
        _app_dir: &Path,
        _app_spec: &AppDeploymentSpec,
        manifests: &[Manifest],
    ) -> Result<(), PipedError> {
        let aws = self.tools.ensure("aws", "").await?;
        let function = manifests
            .first()
            .ok_or_else(|| PipedError::ProviderError("empty function manifest".to_string()))?;
        let name = function.key.name.clone();
        let image = function
            .data
            .get("image")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipedError::ProviderError("function manifest is missing image".to_string())
            })?
            .to_string();

        let mut args = vec![
            "lambda",
            "update-function-code",
            "--function-name",
            name.as_str(),
            "--image-uri",
            image.as_str(),
        ];
        self.region_args(&mut args);

        info!("Updating function {} for {}", name, app_id);
        run_tool(&aws, None, &args, None).await?;
        Ok(())
    }

    async fn promote(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
        percent: u32,
    ) -> Result<(), PipedError> {
        let aws = self.tools.ensure("aws", "").await?;
        let manifests = self.load_manifests(app_dir, app_spec).await?;
        let name = manifests[0].key.name.clone();

        // Weighted alias routing against $LATEST.
        let weight = f64::from(percent.min(100)) / 100.0;
        let routing = format!(
            "{{\"AdditionalVersionWeights\":{{\"$LATEST\":{}}}}}",
            weight
        );
        let mut args = vec![
            "lambda",
            "update-alias",
            "--function-name",
            name.as_str(),
            "--name",
            "primary",
            "--routing-config",
            routing.as_str(),
        ];
        self.region_args(&mut args);

        info!("Routing {}% of {} traffic to the new version", percent, name);
        run_tool(&aws, None, &args, None).await?;
        Ok(())
    }
}

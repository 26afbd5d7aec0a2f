//! Terraform provider

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{run_tool, CloudProvider, Manifest, ResourceKey};
use crate::config::{AppDeploymentSpec, CloudProviderConfig, CloudProviderKind};
use crate::errors::PipedError;
use crate::toolregistry::ToolRegistry;

pub struct TerraformProvider {
    config: CloudProviderConfig,
    tools: Arc<ToolRegistry>,
}

impl TerraformProvider {
    pub fn new(config: CloudProviderConfig, tools: Arc<ToolRegistry>) -> Self {
        Self { config, tools }
    }

    async fn terraform(
        &self,
        app_spec: &AppDeploymentSpec,
    ) -> Result<std::path::PathBuf, PipedError> {
        let version = match app_spec {
            AppDeploymentSpec::Terraform(s) => s.input.terraform_version.as_str(),
            _ => "",
        };
        self.tools.ensure("terraform", version).await
    }

    fn var_args(app_spec: &AppDeploymentSpec) -> Vec<String> {
        match app_spec {
            AppDeploymentSpec::Terraform(s) => s
                .input
                .vars
                .iter()
                .map(|v| format!("-var={}", v))
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn init(&self, terraform: &Path, app_dir: &Path) -> Result<(), PipedError> {
        run_tool(terraform, Some(app_dir), &["init", "-no-color", "-input=false"], None).await?;
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for TerraformProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::Terraform
    }

    /// Each `.tf` file is one manifest keyed by its filename, so the diff
    /// reports which module files changed between commits.
    async fn load_manifests(
        &self,
        app_dir: &Path,
        _app_spec: &AppDeploymentSpec,
    ) -> Result<Vec<Manifest>, PipedError> {
        let mut manifests = Vec::new();
        let mut entries = tokio::fs::read_dir(app_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("tf") {
                files.push(path);
            }
        }
        files.sort();

        for file in files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let content = tokio::fs::read_to_string(&file).await?;
            manifests.push(Manifest::new(
                ResourceKey::new("terraform.io", "Module", "", name),
                serde_json::json!({ "content": content }),
            ));
        }

        if manifests.is_empty() {
            return Err(PipedError::ProviderError(format!(
                "no .tf files found under {}",
                app_dir.display()
            )));
        }
        Ok(manifests)
    }

    async fn apply(
        &self,
        app_id: &str,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
        _manifests: &[Manifest],
    ) -> Result<(), PipedError> {
        let terraform = self.terraform(app_spec).await?;
        self.init(&terraform, app_dir).await?;

        let vars = Self::var_args(app_spec);
        let mut args = vec!["apply", "-auto-approve", "-no-color", "-input=false"];
        args.extend(vars.iter().map(|v| v.as_str()));

        info!("Applying terraform module for {}", app_id);
        run_tool(&terraform, Some(app_dir), &args, None).await?;
        Ok(())
    }

    async fn preview(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<String, PipedError> {
        let terraform = self.terraform(app_spec).await?;
        self.init(&terraform, app_dir).await?;

        let vars = Self::var_args(app_spec);
        let mut args = vec!["plan", "-no-color", "-input=false"];
        args.extend(vars.iter().map(|v| v.as_str()));

        run_tool(&terraform, Some(app_dir), &args, None).await
    }
}

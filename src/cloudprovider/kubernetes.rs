//! Kubernetes provider

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{list_yaml_files, run_tool, CloudProvider, Manifest, ResourceKey, MANAGED_BY_LABEL};
use crate::config::{AppDeploymentSpec, CloudProviderConfig, CloudProviderKind};
use crate::errors::PipedError;
use crate::model::Application;
use crate::toolregistry::ToolRegistry;

/// Resource kinds read back when building the live snapshot.
const LIVE_KINDS: &str = "deployments,statefulsets,daemonsets,services,configmaps,secrets";

pub struct KubernetesProvider {
    config: CloudProviderConfig,
    tools: Arc<ToolRegistry>,
}

impl KubernetesProvider {
    pub fn new(config: CloudProviderConfig, tools: Arc<ToolRegistry>) -> Self {
        Self { config, tools }
    }

    fn base_args<'a>(&'a self, namespace: &'a str) -> Vec<&'a str> {
        let mut args = Vec::new();
        if !self.config.kubeconfig_path.is_empty() {
            args.push("--kubeconfig");
            args.push(self.config.kubeconfig_path.as_str());
        }
        let ns = if namespace.is_empty() {
            self.config.namespace.as_str()
        } else {
            namespace
        };
        if !ns.is_empty() {
            args.push("--namespace");
            args.push(ns);
        }
        args
    }

    async fn kubectl(&self, app_spec: Option<&AppDeploymentSpec>) -> Result<std::path::PathBuf, PipedError> {
        let version = app_spec
            .and_then(|s| s.kubernetes())
            .map(|s| s.input.kubectl_version.as_str())
            .unwrap_or("");
        self.tools.ensure("kubectl", version).await
    }

    fn namespace_of(app_spec: &AppDeploymentSpec) -> &str {
        app_spec
            .kubernetes()
            .map(|s| s.input.namespace.as_str())
            .unwrap_or("")
    }
}

#[async_trait]
impl CloudProvider for KubernetesProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::Kubernetes
    }

    async fn load_manifests(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<Vec<Manifest>, PipedError> {
        let named = app_spec
            .kubernetes()
            .map(|s| s.input.manifests.clone())
            .unwrap_or_default();

        let files = if named.is_empty() {
            list_yaml_files(app_dir).await?
        } else {
            named.iter().map(|f| app_dir.join(f)).collect()
        };

        let mut manifests = Vec::new();
        for file in files {
            let text = tokio::fs::read_to_string(&file).await.map_err(|e| {
                PipedError::ProviderError(format!("failed to read {}: {}", file.display(), e))
            })?;
            manifests.extend(Manifest::from_yaml_multi(&text)?);
        }
        if manifests.is_empty() {
            return Err(PipedError::ProviderError(format!(
                "no manifests found under {}",
                app_dir.display()
            )));
        }
        Ok(manifests)
    }

    async fn live_manifests(&self, app: &Application) -> Result<Vec<Manifest>, PipedError> {
        let kubectl = self.kubectl(None).await?;
        let selector = format!("{}={}", MANAGED_BY_LABEL, app.id);
        let mut args = self.base_args("");
        args.extend(["get", LIVE_KINDS, "--selector", &selector, "--output", "json"]);

        let out = run_tool(&kubectl, None, &args, None).await?;
        let body: serde_json::Value = serde_json::from_str(&out)?;
        let items = body
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut manifests = Vec::with_capacity(items.len());
        for item in items {
            manifests.push(Manifest::from_json(item)?);
        }
        debug!("Read {} live resources for {}", manifests.len(), app.id);
        Ok(manifests)
    }

    async fn apply(
        &self,
        app_id: &str,
        _app_dir: &Path,
        app_spec: &AppDeploymentSpec,
        manifests: &[Manifest],
    ) -> Result<(), PipedError> {
        let kubectl = self.kubectl(Some(app_spec)).await?;

        let mut docs = String::new();
        for manifest in manifests {
            let mut labeled = manifest.clone();
            labeled.add_label(MANAGED_BY_LABEL, app_id);
            docs.push_str(&labeled.to_yaml()?);
            docs.push_str("---\n");
        }

        let mut args = self.base_args(Self::namespace_of(app_spec));
        args.extend(["apply", "--filename", "-"]);

        info!("Applying {} manifests for {}", manifests.len(), app_id);
        run_tool(&kubectl, None, &args, Some(&docs)).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[ResourceKey]) -> Result<(), PipedError> {
        let kubectl = self.kubectl(None).await?;
        for key in keys {
            let mut args = self.base_args(&key.namespace);
            args.extend(["delete", &key.kind, &key.name, "--ignore-not-found"]);
            run_tool(&kubectl, None, &args, None).await?;
        }
        Ok(())
    }

    async fn preview(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<String, PipedError> {
        let kubectl = self.kubectl(Some(app_spec)).await?;
        let manifests = self.load_manifests(app_dir, app_spec).await?;

        let mut docs = String::new();
        for manifest in &manifests {
            docs.push_str(&manifest.to_yaml()?);
            docs.push_str("---\n");
        }

        let mut args = self.base_args(Self::namespace_of(app_spec));
        args.extend(["diff", "--filename", "-"]);
        // kubectl diff exits 1 when differences exist.
        match run_tool(&kubectl, None, &args, Some(&docs)).await {
            Ok(out) => Ok(out),
            Err(PipedError::ProviderError(msg)) => Ok(msg),
            Err(e) => Err(e),
        }
    }
}

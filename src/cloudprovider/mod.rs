//! Cloud providers
//!
//! A uniform interface over the runtimes the agent deploys to. Providers
//! read desired manifests from a deploy-source directory, read live
//! resources, and apply changes; the structural diff is shared.

pub mod cloudrun;
pub mod diff;
pub mod ecs;
pub mod kubernetes;
pub mod lambda;
pub mod manifest;
pub mod terraform;

pub use diff::{diff, DiffRecord, DiffResultList};
pub use manifest::{Manifest, ResourceKey, MANAGED_BY_LABEL};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{AppDeploymentSpec, CloudProviderKind, PipedSpec};
use crate::errors::PipedError;
use crate::model::Application;
use crate::toolregistry::ToolRegistry;

/// The operations every provider offers. Diffing is shared and works on
/// the manifests returned by `load_manifests` / `live_manifests`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> CloudProviderKind;

    /// Load the desired manifests from the application's deploy source.
    async fn load_manifests(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<Vec<Manifest>, PipedError>;

    /// Read the live resources managed for the application.
    /// NotFound for pull-only providers without live-state support.
    async fn live_manifests(&self, app: &Application) -> Result<Vec<Manifest>, PipedError> {
        let _ = app;
        Err(PipedError::NotFound(format!(
            "live state is not supported by provider {}",
            self.name()
        )))
    }

    /// Apply the manifests, labeling them as managed for the application.
    async fn apply(
        &self,
        app_id: &str,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
        manifests: &[Manifest],
    ) -> Result<(), PipedError>;

    /// Delete the identified resources.
    async fn delete(&self, keys: &[ResourceKey]) -> Result<(), PipedError> {
        let _ = keys;
        Err(PipedError::ProviderError(format!(
            "delete is not supported by provider {}",
            self.name()
        )))
    }

    /// Render what apply would change, where the runtime supports it.
    async fn preview(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
    ) -> Result<String, PipedError> {
        let _ = (app_dir, app_spec);
        Err(PipedError::ProviderError(format!(
            "preview is not supported by provider {}",
            self.name()
        )))
    }

    /// Shift traffic to the newest revision, where the runtime supports it.
    async fn promote(
        &self,
        app_dir: &Path,
        app_spec: &AppDeploymentSpec,
        percent: u32,
    ) -> Result<(), PipedError> {
        let _ = (app_dir, app_spec, percent);
        Err(PipedError::ProviderError(format!(
            "promote is not supported by provider {}",
            self.name()
        )))
    }
}

/// Named providers built once at startup from the piped configuration.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn from_spec(spec: &PipedSpec, tools: Arc<ToolRegistry>) -> Self {
        let mut providers: HashMap<String, Arc<dyn CloudProvider>> = HashMap::new();
        for cp in &spec.cloud_providers {
            let provider: Arc<dyn CloudProvider> = match cp.kind {
                CloudProviderKind::Kubernetes => {
                    Arc::new(kubernetes::KubernetesProvider::new(cp.clone(), tools.clone()))
                }
                CloudProviderKind::Terraform => {
                    Arc::new(terraform::TerraformProvider::new(cp.clone(), tools.clone()))
                }
                CloudProviderKind::CloudRun => {
                    Arc::new(cloudrun::CloudRunProvider::new(cp.clone(), tools.clone()))
                }
                CloudProviderKind::Lambda => {
                    Arc::new(lambda::LambdaProvider::new(cp.clone(), tools.clone()))
                }
                CloudProviderKind::Ecs => {
                    Arc::new(ecs::EcsProvider::new(cp.clone(), tools.clone()))
                }
            };
            providers.insert(cp.name.clone(), provider);
        }
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CloudProvider>> {
        self.providers.get(name).cloned()
    }
}

/// Run an external tool, returning stdout or a provider error with stderr.
pub(crate) async fn run_tool(
    program: &Path,
    dir: Option<&Path>,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<String, PipedError> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        PipedError::ProviderError(format!("failed to run {}: {}", program.display(), e))
    })?;

    if let Some(input) = stdin {
        let mut handle = child.stdin.take().ok_or_else(|| {
            PipedError::ProviderError("failed to open tool stdin".to_string())
        })?;
        handle.write_all(input.as_bytes()).await?;
        drop(handle);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipedError::ProviderError(format!(
            "{} {} failed: {}",
            program.display(),
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// List the YAML files the kubernetes-style providers load when the spec
/// does not name explicit manifests.
pub(crate) async fn list_yaml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, PipedError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if path.is_file() && (ext == "yaml" || ext == "yml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

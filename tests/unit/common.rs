//! Shared test fixtures

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use piped::cloudprovider::{CloudProvider, Manifest, ResourceKey};
use piped::config::{AppDeploymentSpec, CloudProviderKind};
use piped::errors::PipedError;
use piped::model::{
    Application, ApplicationGitPath, ApplicationKind, Commit, Deployment, DeploymentStatus,
    DeploymentTrigger,
};

pub fn kubernetes_app(id: &str, last_commit: &str) -> Application {
    Application {
        id: id.to_string(),
        name: id.to_string(),
        env_id: "env-1".to_string(),
        kind: ApplicationKind::Kubernetes,
        git_path: ApplicationGitPath {
            repo_id: "main".to_string(),
            path: "app".to_string(),
            branch: String::new(),
            config_filename: String::new(),
        },
        cloud_provider: "kubernetes-default".to_string(),
        disabled: false,
        most_recent_successful_commit_hash: last_commit.to_string(),
        sync_state: None,
    }
}

pub fn deployment_for(app: &Application, commit_hash: &str, message: &str) -> Deployment {
    let now = Utc::now();
    Deployment {
        id: format!("deployment-{}", commit_hash),
        application_id: app.id.clone(),
        application_name: app.name.clone(),
        env_id: app.env_id.clone(),
        kind: app.kind,
        cloud_provider: app.cloud_provider.clone(),
        trigger: DeploymentTrigger {
            commit: Commit {
                hash: commit_hash.to_string(),
                message: message.to_string(),
                author: "dev".to_string(),
                branch: "master".to_string(),
                created_at: None,
            },
            commander: String::new(),
            timestamp: Some(now),
        },
        status: DeploymentStatus::Pending,
        status_reason: String::new(),
        stages: Vec::new(),
        running_commit_hash: String::new(),
        summary: String::new(),
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

pub fn workload_manifest(replicas: u64, image: &str) -> Manifest {
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

/// Run a git command in a fixture repository.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a fixture repository with a deployable kubernetes application
/// under `app/`. Returns the first commit hash.
pub fn init_upstream_repo(dir: &Path) -> String {
    StdCommand::new("git")
        .args(["init", "-b", "master", &dir.to_string_lossy()])
        .output()
        .expect("git init");
    git(dir, &["config", "user.name", "tester"]);
    git(dir, &["config", "user.email", "tester@example.com"]);

    std::fs::create_dir_all(dir.join("app")).unwrap();
    std::fs::write(
        dir.join("app/.pipe.yaml"),
        "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("app/deployment.yaml"),
        concat!(
            "apiVersion: apps/v1\n",
            "kind: Deployment\n",
            "metadata:\n  name: app\n  namespace: default\n",
            "spec:\n  replicas: 3\n",
        ),
    )
    .unwrap();
    commit_all(dir, "initial application")
}

pub fn commit_all(dir: &Path, message: &str) -> String {
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

/// A minimal piped spec pointing at one fixture repository.
pub fn piped_spec_for(remote: &Path) -> piped::config::PipedSpec {
    let doc = format!(
        concat!(
            "apiAddress: control-plane:443\n",
            "projectID: test\n",
            "pipedID: piped-1\n",
            "pipedKeyFile: /tmp/key\n",
            "repositories:\n",
            "  - repoId: main\n",
            "    remote: {}\n",
            "    branch: master\n",
            "cloudProviders:\n",
            "  - name: kubernetes-default\n",
            "    type: KUBERNETES\n",
        ),
        remote.display()
    );
    serde_yaml::from_str(&doc).unwrap()
}

/// In-memory provider serving manifests per deploy-source directory and
/// recording every mutation.
pub struct FakeProvider {
    manifests_by_dir: Mutex<HashMap<PathBuf, Vec<Manifest>>>,
    pub applied: Mutex<Vec<(String, Vec<Manifest>)>>,
    pub deleted: Mutex<Vec<ResourceKey>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            manifests_by_dir: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn serve(&self, dir: impl Into<PathBuf>, manifests: Vec<Manifest>) {
        self.manifests_by_dir
            .lock()
            .unwrap()
            .insert(dir.into(), manifests);
    }

    pub fn applied_images(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, manifests)| manifests.iter())
            .filter_map(|m| {
                m.field("spec.template.spec.containers")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("image"))
                    .and_then(|i| i.as_str())
                    .map(|s| s.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    fn name(&self) -> &str {
        "kubernetes-default"
    }

    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::Kubernetes
    }

    async fn load_manifests(
        &self,
        app_dir: &Path,
        _app_spec: &AppDeploymentSpec,
    ) -> Result<Vec<Manifest>, PipedError> {
        self.manifests_by_dir
            .lock()
            .unwrap()
            .get(app_dir)
            .cloned()
            .ok_or_else(|| {
                PipedError::ProviderError(format!("no manifests under {}", app_dir.display()))
            })
    }

    async fn apply(
        &self,
        app_id: &str,
        _app_dir: &Path,
        _app_spec: &AppDeploymentSpec,
        manifests: &[Manifest],
    ) -> Result<(), PipedError> {
        self.applied
            .lock()
            .unwrap()
            .push((app_id.to_string(), manifests.to_vec()));
        Ok(())
    }

    async fn delete(&self, keys: &[ResourceKey]) -> Result<(), PipedError> {
        self.deleted.lock().unwrap().extend(keys.iter().cloned());
        Ok(())
    }
}

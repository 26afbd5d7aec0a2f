//! Trigger tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use piped::apiclient::FakeApiClient;
use piped::apistore::{
    ApplicationLister, ApplicationStore, CommandLister, CommandStore, DeploymentLister,
    DeploymentStore,
};
use piped::git::GitClient;
use piped::model::{Command, CommandKind};
use piped::trigger::Trigger;

use crate::common::{commit_all, init_upstream_repo, kubernetes_app, piped_spec_for};

struct Fixture {
    api: Arc<FakeApiClient>,
    command_store: Arc<CommandStore>,
    trigger: Trigger,
    _upstream: tempfile::TempDir,
    _workspace: tempfile::TempDir,
    upstream_dir: std::path::PathBuf,
}

async fn fixture(last_commit: &str) -> (Fixture, String) {
    let upstream = tempfile::tempdir().unwrap();
    let first_commit = init_upstream_repo(upstream.path());

    let api = Arc::new(FakeApiClient::new());
    let last = if last_commit == "FIRST" {
        first_commit.clone()
    } else {
        last_commit.to_string()
    };
    api.set_applications(vec![kubernetes_app("app-1", &last)]);

    let app_store = Arc::new(ApplicationStore::new(api.clone(), Duration::from_secs(30)));
    app_store.refresh().await;
    let deployment_store = Arc::new(DeploymentStore::new(api.clone(), Duration::from_secs(30)));
    deployment_store.refresh().await;
    let command_store = Arc::new(CommandStore::new(api.clone(), Duration::from_secs(30)));
    command_store.refresh().await;

    let workspace = tempfile::tempdir().unwrap();
    let git = Arc::new(GitClient::new(
        "piped",
        "piped@example.com",
        workspace.path(),
    ));

    let trigger = Trigger::new(
        api.clone(),
        git,
        ApplicationLister::new(app_store),
        DeploymentLister::new(deployment_store),
        CommandLister::new(command_store.clone()),
        piped::notifier::noop(),
        Arc::new(piped_spec_for(upstream.path())),
        Duration::from_secs(60),
    );

    let upstream_dir = upstream.path().to_path_buf();
    (
        Fixture {
            api,
            command_store,
            trigger,
            _upstream: upstream,
            _workspace: workspace,
            upstream_dir,
        },
        first_commit,
    )
}

#[tokio::test]
async fn test_no_deployment_when_head_unchanged() {
    let (fx, _) = fixture("FIRST").await;

    fx.trigger.check_repositories().await;
    assert!(fx.api.deployments().is_empty());
}

#[tokio::test]
async fn test_changes_outside_trigger_paths_are_ignored() {
    let (fx, _) = fixture("FIRST").await;

    std::fs::create_dir_all(fx.upstream_dir.join("docs")).unwrap();
    std::fs::write(fx.upstream_dir.join("docs/readme.md"), "notes").unwrap();
    commit_all(&fx.upstream_dir, "update docs");

    fx.trigger.check_repositories().await;
    assert!(fx.api.deployments().is_empty());
}

#[tokio::test]
async fn test_app_change_triggers_exactly_once() {
    let (fx, _) = fixture("FIRST").await;

    std::fs::write(
        fx.upstream_dir.join("app/deployment.yaml"),
        concat!(
            "apiVersion: apps/v1\n",
            "kind: Deployment\n",
            "metadata:\n  name: app\n  namespace: default\n",
            "spec:\n  replicas: 5\n",
        ),
    )
    .unwrap();
    let head = commit_all(&fx.upstream_dir, "scale up");

    fx.trigger.check_repositories().await;
    let deployments = fx.api.deployments();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].trigger.commit.hash, head);
    assert_eq!(deployments[0].application_id, "app-1");

    // Idempotent: the same head observation never creates a second record.
    fx.trigger.check_repositories().await;
    assert_eq!(fx.api.deployments().len(), 1);
}

#[tokio::test]
async fn test_first_observation_triggers_without_path_check() {
    // No successful commit recorded yet.
    let (fx, first_commit) = fixture("").await;

    fx.trigger.check_repositories().await;
    let deployments = fx.api.deployments();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].trigger.commit.hash, first_commit);
}

#[tokio::test]
async fn test_sync_command_triggers_and_acknowledges() {
    let (fx, first_commit) = fixture("FIRST").await;

    fx.api.push_command(Command {
        id: "cmd-sync".to_string(),
        kind: CommandKind::SyncApplication,
        commander: "alice".to_string(),
        application_id: "app-1".to_string(),
        deployment_id: String::new(),
        stage_id: String::new(),
        force_rollback: false,
        force_no_rollback: false,
        handled: false,
        created_at: Utc::now(),
    });
    // Surface the new command in the store snapshot.
    fx.command_store.refresh().await;

    fx.trigger.check_commands().await;

    let deployments = fx.api.deployments();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].trigger.commit.hash, first_commit);
    assert_eq!(deployments[0].trigger.commander, "alice");
}

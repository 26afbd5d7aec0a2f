//! Scheduler state machine tests

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use piped::apiclient::{FakeApiClient, RecordedCall};
use piped::apistore::{CommandLister, CommandStore};
use piped::cache::SingleflightCache;
use piped::config::Config;
use piped::controller::Scheduler;
use piped::executor::{ExecutorRegistry, StopSignal, StopSignalHandler, StopSignalKind};
use piped::model::{Command, CommandKind, DeploymentStatus, Stage, StageStatus};
use piped::planner::{build_progressive_stages, build_quick_sync_stages};

use crate::common::{deployment_for, kubernetes_app, workload_manifest, FakeProvider};

const TARGET_DIR: &str = "/workspace/target";
const RUNNING_DIR: &str = "/workspace/running";

struct Fixture {
    api: Arc<FakeApiClient>,
    provider: Arc<FakeProvider>,
    handler: StopSignalHandler,
    scheduler: Scheduler,
}

async fn fixture(app_config: &str, stages: Vec<Stage>, running: bool) -> Fixture {
    let api = Arc::new(FakeApiClient::new());
    let app = kubernetes_app("app-1", if running { "oldcommit" } else { "" });

    let mut deployment = deployment_for(&app, "feedbeef", "bump app");
    deployment.status = DeploymentStatus::Planned;
    deployment.running_commit_hash = app.most_recent_successful_commit_hash.clone();
    deployment.stages = stages;
    api.set_deployments(vec![deployment.clone()]);

    let provider = Arc::new(FakeProvider::new());
    provider.serve(TARGET_DIR, vec![workload_manifest(3, "app:1.3")]);
    if running {
        provider.serve(RUNNING_DIR, vec![workload_manifest(3, "app:1.2")]);
    }

    let command_store = Arc::new(CommandStore::new(api.clone(), Duration::from_secs(30)));
    command_store.refresh().await;

    let app_spec = Arc::new(Config::from_yaml(app_config).unwrap().app_spec().unwrap());
    let (handler, sig) = StopSignal::new();
    let scheduler = Scheduler::new(
        api.clone(),
        Arc::new(ExecutorRegistry::default_registry()),
        provider.clone(),
        CommandLister::new(command_store),
        Arc::new(SingleflightCache::new(Duration::from_secs(60))),
        piped::notifier::noop(),
        deployment,
        app,
        app_spec,
        PathBuf::from(TARGET_DIR),
        running.then(|| PathBuf::from(RUNNING_DIR)),
        sig,
        Duration::from_millis(10),
    );

    Fixture {
        api,
        provider,
        handler,
        scheduler,
    }
}

fn stage_reports(api: &FakeApiClient) -> Vec<(String, StageStatus)> {
    api.calls()
        .into_iter()
        .filter_map(|c| match c {
            RecordedCall::StageStatus {
                stage_id, status, ..
            } => Some((stage_id, status)),
            _ => None,
        })
        .collect()
}

fn completion(api: &FakeApiClient) -> Option<(DeploymentStatus, String)> {
    api.calls().into_iter().find_map(|c| match c {
        RecordedCall::DeploymentCompleted { status, reason, .. } => Some((status, reason)),
        _ => None,
    })
}

const QUICK_SYNC_CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec: {}
"#;

#[tokio::test]
async fn test_quick_sync_deployment_succeeds() {
    let fx = fixture(
        QUICK_SYNC_CONFIG,
        build_quick_sync_stages(piped::model::ApplicationKind::Kubernetes, true),
        false,
    )
    .await;

    let status = fx.scheduler.run().await;
    assert_eq!(status, DeploymentStatus::Success);

    // The sync stage applied the target manifests once.
    assert_eq!(fx.provider.applied_images(), vec!["app:1.3".to_string()]);
    // The rollback stage never ran.
    let reports = stage_reports(&fx.api);
    assert!(reports.iter().all(|(id, _)| id != "stage-rollback"));

    let (status, _) = completion(&fx.api).unwrap();
    assert_eq!(status, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_stage_transitions_are_monotonic_and_dag_ordered() {
    let config = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: WAIT
      - name: K8S_PRIMARY_ROLLOUT
"#;
    let spec = Config::from_yaml(config).unwrap().app_spec().unwrap();
    let stages = build_progressive_stages(spec.generic().pipeline.as_ref().unwrap(), false);
    let fx = fixture(config, stages, false).await;

    let status = fx.scheduler.run().await;
    assert_eq!(status, DeploymentStatus::Success);

    let reports = stage_reports(&fx.api);

    // stage-1 must not start before its predecessor succeeded.
    let stage0_success = reports
        .iter()
        .position(|(id, s)| id == "stage-0" && *s == StageStatus::Success)
        .unwrap();
    let stage1_running = reports
        .iter()
        .position(|(id, s)| id == "stage-1" && *s == StageStatus::Running)
        .unwrap();
    assert!(stage0_success < stage1_running);

    // No terminal -> non-terminal edge per stage.
    let mut terminal: HashMap<&str, bool> = HashMap::new();
    for (id, status) in &reports {
        let done = terminal.entry(id.as_str()).or_default();
        assert!(!*done, "stage {} reported {:?} after a terminal state", id, status);
        if status.is_completed() {
            *done = true;
        }
    }
}

#[tokio::test]
async fn test_cancel_with_rollback() {
    let config = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_PRIMARY_ROLLOUT
"#;
    let spec = Config::from_yaml(config).unwrap().app_spec().unwrap();
    let stages = build_progressive_stages(spec.generic().pipeline.as_ref().unwrap(), true);
    let fx = fixture(config, stages, true).await;

    // The cancel command arrives before the rollout mutates anything.
    fx.handler.cancel(StopSignalKind::CancelWithRollback);

    let status = fx.scheduler.run().await;
    assert_eq!(status, DeploymentStatus::Failure);

    let reports = stage_reports(&fx.api);
    assert!(reports
        .iter()
        .any(|(id, s)| id == "stage-0" && *s == StageStatus::Cancelled));
    assert!(reports
        .iter()
        .any(|(id, s)| id == "stage-rollback" && *s == StageStatus::Success));

    // The rollback re-applied the running commit's manifests.
    assert_eq!(fx.provider.applied_images(), vec!["app:1.2".to_string()]);

    let (status, reason) = completion(&fx.api).unwrap();
    assert_eq!(status, DeploymentStatus::Failure);
    assert_eq!(reason, "cancelled");
}

#[tokio::test]
async fn test_approval_timeout_fails_the_stage() {
    let config = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: WAIT_APPROVAL
        with:
          timeout: 1s
"#;
    let spec = Config::from_yaml(config).unwrap().app_spec().unwrap();
    let mut stages = build_progressive_stages(spec.generic().pipeline.as_ref().unwrap(), false);
    // The stage has been waiting since before its timeout.
    stages[0].created_at = Utc::now() - chrono::Duration::seconds(2);
    let fx = fixture(config, stages, false).await;

    let status = fx.scheduler.run().await;
    assert_eq!(status, DeploymentStatus::Failure);

    let reports = fx.api.calls();
    assert!(reports.iter().any(|c| matches!(
        c,
        RecordedCall::StageStatus { stage_id, status: StageStatus::Failure, reason, .. }
            if stage_id == "stage-0" && reason == "approval timeout"
    )));
}

#[tokio::test]
async fn test_approval_records_approver_and_succeeds() {
    let config = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: WAIT_APPROVAL
        with:
          approvers:
            - alice
"#;
    let spec = Config::from_yaml(config).unwrap().app_spec().unwrap();
    let stages = build_progressive_stages(spec.generic().pipeline.as_ref().unwrap(), false);

    let api = Arc::new(FakeApiClient::new());
    api.push_command(Command {
        id: "cmd-1".to_string(),
        kind: CommandKind::ApproveStage,
        commander: "alice".to_string(),
        application_id: "app-1".to_string(),
        deployment_id: "deployment-feedbeef".to_string(),
        stage_id: "stage-0".to_string(),
        force_rollback: false,
        force_no_rollback: false,
        handled: false,
        created_at: Utc::now(),
    });

    let app = kubernetes_app("app-1", "oldcommit");
    let mut deployment = deployment_for(&app, "feedbeef", "bump app");
    deployment.status = DeploymentStatus::Planned;
    deployment.stages = stages;
    api.set_deployments(vec![deployment.clone()]);

    let provider = Arc::new(FakeProvider::new());
    let command_store = Arc::new(CommandStore::new(api.clone(), Duration::from_secs(30)));
    command_store.refresh().await;

    let (_handler, sig) = StopSignal::new();
    let scheduler = Scheduler::new(
        api.clone(),
        Arc::new(ExecutorRegistry::default_registry()),
        provider,
        CommandLister::new(command_store),
        Arc::new(SingleflightCache::new(Duration::from_secs(60))),
        piped::notifier::noop(),
        deployment,
        app,
        Arc::new(Config::from_yaml(config).unwrap().app_spec().unwrap()),
        PathBuf::from(TARGET_DIR),
        None,
        sig,
        Duration::from_millis(10),
    );

    let status = scheduler.run().await;
    assert_eq!(status, DeploymentStatus::Success);

    // The approver landed in the stage metadata.
    let stored = api.deployments();
    let stage = stored[0].stage("stage-0").unwrap();
    assert_eq!(stage.metadata.get("approved-by").map(String::as_str), Some("alice"));

    // The approval command was acknowledged.
    assert!(api
        .calls()
        .iter()
        .any(|c| matches!(c, RecordedCall::CommandHandled { command_id } if command_id == "cmd-1")));
}

#[tokio::test]
async fn test_unsupported_stage_fails() {
    // An ECS stage inside a kubernetes deployment cannot be dispatched.
    let mut stages = build_quick_sync_stages(piped::model::ApplicationKind::Kubernetes, false);
    stages[0].name = piped::model::StageName::EcsSync;

    let fx = fixture(QUICK_SYNC_CONFIG, stages, false).await;
    let status = fx.scheduler.run().await;
    assert_eq!(status, DeploymentStatus::Failure);

    assert!(fx.api.calls().iter().any(|c| matches!(
        c,
        RecordedCall::StageStatus { status: StageStatus::Failure, reason, .. }
            if reason == "unsupported stage"
    )));
}

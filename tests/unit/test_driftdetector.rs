//! Drift detector tests

use std::sync::Arc;
use std::time::Duration;

use piped::apiclient::{FakeApiClient, RecordedCall};
use piped::apistore::{
    ApplicationLister, ApplicationStore, DeploymentLister, DeploymentStore,
};
use piped::cloudprovider::ProviderRegistry;
use piped::driftdetector::DriftDetector;
use piped::git::GitClient;
use piped::livestatestore::LiveStateStore;
use piped::model::{DeploymentStatus, SyncStatus};
use piped::toolregistry::ToolRegistry;

use crate::common::{commit_all, deployment_for, init_upstream_repo, kubernetes_app, piped_spec_for};

struct Fixture {
    api: Arc<FakeApiClient>,
    deployment_store: Arc<DeploymentStore>,
    detector: DriftDetector,
    _upstream: tempfile::TempDir,
    _workspace: tempfile::TempDir,
    upstream_dir: std::path::PathBuf,
}

async fn fixture() -> Fixture {
    let upstream = tempfile::tempdir().unwrap();
    init_upstream_repo(upstream.path());

    let api = Arc::new(FakeApiClient::new());
    api.set_applications(vec![kubernetes_app("app-1", "somecommit")]);

    let app_store = Arc::new(ApplicationStore::new(api.clone(), Duration::from_secs(30)));
    app_store.refresh().await;
    let app_lister = ApplicationLister::new(app_store);

    let deployment_store = Arc::new(DeploymentStore::new(api.clone(), Duration::from_secs(30)));
    deployment_store.refresh().await;

    let workspace = tempfile::tempdir().unwrap();
    let git = Arc::new(GitClient::new(
        "piped",
        "piped@example.com",
        workspace.path(),
    ));

    let spec = Arc::new(piped_spec_for(upstream.path()));
    let tools = Arc::new(ToolRegistry::new(workspace.path().join("tools")));
    let providers = Arc::new(ProviderRegistry::from_spec(&spec, tools));

    let livestate = Arc::new(LiveStateStore::new(
        app_lister.clone(),
        providers.clone(),
        Duration::from_secs(60),
    ));

    let detector = DriftDetector::new(
        api.clone(),
        git,
        app_lister,
        DeploymentLister::new(deployment_store.clone()),
        livestate.getter(),
        providers,
        piped::notifier::noop(),
        spec,
        Duration::from_secs(60),
    );

    let upstream_dir = upstream.path().to_path_buf();
    Fixture {
        api,
        deployment_store,
        detector,
        _upstream: upstream,
        _workspace: workspace,
        upstream_dir,
    }
}

fn sync_reports(api: &FakeApiClient) -> Vec<SyncStatus> {
    api.calls()
        .into_iter()
        .filter_map(|c| match c {
            RecordedCall::SyncState { state, .. } => Some(state.status),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_unpopulated_live_state_is_unknown_and_edge_suppressed() {
    let fx = fixture().await;

    fx.detector.detect_all().await;
    assert_eq!(sync_reports(&fx.api), vec![SyncStatus::Unknown]);

    // An unchanged world emits nothing on re-detection.
    fx.detector.detect_all().await;
    fx.detector.detect_all().await;
    assert_eq!(sync_reports(&fx.api), vec![SyncStatus::Unknown]);
}

#[tokio::test]
async fn test_broken_configuration_reports_invalid_config() {
    let fx = fixture().await;
    fx.detector.detect_all().await;

    std::fs::write(
        fx.upstream_dir.join("app/.pipe.yaml"),
        "apiVersion: pipecd.dev/v1beta1\nkind: Bogus\nspec: {}\n",
    )
    .unwrap();
    commit_all(&fx.upstream_dir, "break the config");

    fx.detector.detect_all().await;
    assert_eq!(
        sync_reports(&fx.api),
        vec![SyncStatus::Unknown, SyncStatus::InvalidConfig]
    );

    // The reason carries the loader error.
    let reason = fx
        .api
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RecordedCall::SyncState { state, .. } => Some(state),
            _ => None,
        })
        .last()
        .unwrap()
        .reason;
    assert!(reason.contains("unknown configuration kind"));
}

#[tokio::test]
async fn test_in_progress_deployment_suppresses_drift() {
    let fx = fixture().await;

    let app = kubernetes_app("app-1", "somecommit");
    let mut deployment = deployment_for(&app, "feedbeef", "bump app");
    deployment.status = DeploymentStatus::Running;
    fx.api.set_deployments(vec![deployment]);
    fx.deployment_store.refresh().await;

    fx.detector.detect_all().await;
    assert_eq!(sync_reports(&fx.api), vec![SyncStatus::Deploying]);
}

//! Controller planning tests

use std::sync::Arc;
use std::time::Duration;

use piped::apiclient::{FakeApiClient, RecordedCall};
use piped::apistore::{
    ApplicationLister, ApplicationStore, CommandLister, CommandStore, DeploymentLister,
    DeploymentStore,
};
use piped::cache::SingleflightCache;
use piped::cloudprovider::ProviderRegistry;
use piped::controller::Controller;
use piped::executor::ExecutorRegistry;
use piped::git::GitClient;
use piped::planner::PlannerRegistry;
use piped::toolregistry::ToolRegistry;

use crate::common::{deployment_for, init_upstream_repo, kubernetes_app, piped_spec_for};

#[tokio::test]
async fn test_pending_deployment_is_planned_once() {
    let upstream = tempfile::tempdir().unwrap();
    let head = init_upstream_repo(upstream.path());

    let api = Arc::new(FakeApiClient::new());
    let app = kubernetes_app("app-1", "");
    api.set_applications(vec![app.clone()]);
    api.set_deployments(vec![deployment_for(&app, &head, "initial application")]);

    let app_store = Arc::new(ApplicationStore::new(api.clone(), Duration::from_secs(30)));
    app_store.refresh().await;
    let deployment_store = Arc::new(DeploymentStore::new(api.clone(), Duration::from_secs(30)));
    deployment_store.refresh().await;
    let command_store = Arc::new(CommandStore::new(api.clone(), Duration::from_secs(30)));
    command_store.refresh().await;

    let workspace = tempfile::tempdir().unwrap();
    let spec = Arc::new(piped_spec_for(upstream.path()));
    let tools = Arc::new(ToolRegistry::new(workspace.path().join("tools")));
    let providers = Arc::new(ProviderRegistry::from_spec(&spec, tools));

    let controller = Controller::new(
        api.clone(),
        Arc::new(GitClient::new(
            "piped",
            "piped@example.com",
            workspace.path().join("repos"),
        )),
        ApplicationLister::new(app_store),
        DeploymentLister::new(deployment_store.clone()),
        CommandLister::new(command_store),
        Arc::new(PlannerRegistry::default_registry()),
        Arc::new(ExecutorRegistry::default_registry()),
        providers,
        piped::notifier::noop(),
        None,
        spec,
        Arc::new(SingleflightCache::new(Duration::from_secs(60))),
        workspace.path().join("deploys"),
    )
    .with_intervals(Duration::from_millis(50), Duration::from_millis(10));

    controller.sync_once().await;

    // The first deployment has no successful commit to diff against.
    let planned: Vec<(String, Vec<String>)> = api
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RecordedCall::DeploymentPlanned {
                summary,
                stage_names,
                ..
            } => Some((summary, stage_names)),
            _ => None,
        })
        .collect();
    assert_eq!(planned.len(), 1);
    assert!(planned[0]
        .0
        .contains("unable to find the most recent successful commit"));
    assert_eq!(planned[0].1[0], "K8S_SYNC");

    // Planning is idempotent within one process.
    controller.sync_once().await;
    let replanned = api
        .calls()
        .iter()
        .filter(|c| matches!(c, RecordedCall::DeploymentPlanned { .. }))
        .count();
    assert_eq!(replanned, 1);
}

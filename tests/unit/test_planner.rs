//! Planner decision tests

use piped::config::Config;
use piped::model::StageName;
use piped::planner::kubernetes::KubernetesPlanner;
use piped::planner::{Planner, PlannerInput};

use crate::common::{deployment_for, kubernetes_app, workload_manifest};

const APP_CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
        with:
          replicas: 50%
      - name: WAIT_APPROVAL
      - name: K8S_PRIMARY_ROLLOUT
      - name: K8S_CANARY_CLEAN
"#;

fn input(
    last_commit: &str,
    message: &str,
    olds: Vec<piped::cloudprovider::Manifest>,
    news: Vec<piped::cloudprovider::Manifest>,
) -> PlannerInput {
    let app = kubernetes_app("app-1", last_commit);
    let deployment = deployment_for(&app, "feedbeef", message);
    PlannerInput {
        deployment,
        application: app,
        app_spec: Config::from_yaml(APP_CONFIG).unwrap().app_spec().unwrap(),
        most_recent_successful_commit_hash: last_commit.to_string(),
        old_manifests: olds,
        new_manifests: news,
    }
}

#[test]
fn test_first_deployment_quick_syncs() {
    let planner = KubernetesPlanner::new();
    let plan = planner
        .plan(&input("", "add app", vec![], vec![workload_manifest(3, "app:1.0")]))
        .unwrap();

    assert_eq!(plan.stages[0].name, StageName::K8sSync);
    assert!(plan
        .summary
        .contains("unable to find the most recent successful commit"));
}

#[test]
fn test_image_change_plans_progressive_pipeline() {
    let planner = KubernetesPlanner::new();
    let plan = planner
        .plan(&input(
            "abc123",
            "bump app to 1.3",
            vec![workload_manifest(3, "app:1.2")],
            vec![workload_manifest(3, "app:1.3")],
        ))
        .unwrap();

    assert!(plan.summary.contains("image app from 1.2 to 1.3"));
    let names: Vec<StageName> = plan.stages.iter().map(|s| s.name).collect();
    assert_eq!(
        names,
        vec![
            StageName::K8sCanaryRollout,
            StageName::WaitApproval,
            StageName::K8sPrimaryRollout,
            StageName::K8sCanaryClean,
            StageName::Rollback,
        ]
    );
}

#[test]
fn test_scale_only_quick_syncs() {
    let planner = KubernetesPlanner::new();
    let plan = planner
        .plan(&input(
            "abc123",
            "scale up",
            vec![workload_manifest(3, "app:1.2")],
            vec![workload_manifest(5, "app:1.2")],
        ))
        .unwrap();

    assert_eq!(plan.summary, "Scale workload from 3 to 5.");
    assert_eq!(plan.stages[0].name, StageName::K8sSync);
}

#[test]
fn test_rollback_marker_quick_syncs_regardless_of_diff() {
    let planner = KubernetesPlanner::new();
    let plan = planner
        .plan(&input(
            "abc123",
            "revert bad release /pipecd rollback abc123",
            vec![workload_manifest(3, "app:1.2")],
            vec![workload_manifest(3, "app:1.3")],
        ))
        .unwrap();

    assert_eq!(plan.stages[0].name, StageName::K8sSync);
    assert!(plan.summary.contains("Rollback from commit abc123"));
}

#[test]
fn test_plan_is_pure_given_inputs() {
    let planner = KubernetesPlanner::new();
    let make = || {
        input(
            "abc123",
            "bump app",
            vec![workload_manifest(3, "app:1.2")],
            vec![workload_manifest(3, "app:1.3")],
        )
    };
    let a = planner.plan(&make()).unwrap();
    let b = planner.plan(&make()).unwrap();

    assert_eq!(a.summary, b.summary);
    let names = |p: &piped::planner::Plan| p.stages.iter().map(|s| s.name).collect::<Vec<_>>();
    assert_eq!(names(&a), names(&b));
}

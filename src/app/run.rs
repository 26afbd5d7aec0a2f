//! Agent run loop
//!
//! Starts every component under a shared cancellation scope. The first
//! component to return an error broadcasts shutdown, the rest unwind
//! within the grace period, and the process exits non-zero. A termination
//! signal flows through the same cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::admin;
use crate::apiclient::{
    self, ApiClient, PipedCloudProvider, PipedRepository, PipedService, ReportPipedMetaRequest,
    RetryPolicy, SealedSecretEncryption,
};
use crate::apistore::{
    environmentstore, ApplicationLister, ApplicationStore, CommandLister, CommandStore,
    DeploymentLister, DeploymentStore, EnvironmentStore, EventStore, DEFAULT_SYNC_INTERVAL,
};
use crate::app::options::PipedOptions;
use crate::cache::SingleflightCache;
use crate::cloudprovider::ProviderRegistry;
use crate::config::Config;
use crate::controller::Controller;
use crate::driftdetector::{self, DriftDetector};
use crate::errors::PipedError;
use crate::executor::ExecutorRegistry;
use crate::git::GitClient;
use crate::livestatereporter::{self, LiveStateReporter};
use crate::livestatestore::{self, LiveStateStore};
use crate::notifier::Notifier;
use crate::planner::PlannerRegistry;
use crate::sealedsecret;
use crate::statsreporter::{self, StatsReporter};
use crate::toolregistry::ToolRegistry;
use crate::trigger::Trigger;

const MANIFESTS_CACHE_TTL: Duration = Duration::from_secs(3600);

type ComponentResult = (&'static str, Result<(), PipedError>);

/// Run the piped agent until shutdown or the first component failure.
pub async fn run(
    options: PipedOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PipedError> {
    info!("Initializing piped...");

    let cfg = Arc::new(
        Config::load_from_file(&options.config_file)
            .await?
            .piped_spec()?,
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PipedError::Internal(format!("failed to install metrics recorder: {}", e)))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_future = |tx: &broadcast::Sender<()>| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let mut rx = tx.subscribe();
        Box::pin(async move {
            let _ = rx.recv().await;
        })
    };

    let mut set: JoinSet<ComponentResult> = JoinSet::new();

    // Tool registry backing every provider invocation.
    let tools = Arc::new(ToolRegistry::new(&options.tools_dir));
    tools.init().await?;

    // Register the configured Helm chart repositories before anything
    // tries to render a chart.
    add_chart_repositories(&tools, &cfg.chart_repositories).await?;

    // Control-plane client; the first dial blocks within a bounded timeout.
    let piped_key = tokio::fs::read_to_string(&cfg.piped_key_file)
        .await
        .map_err(|e| {
            PipedError::ConfigError(format!(
                "failed to read piped key file {}: {}",
                cfg.piped_key_file, e
            ))
        })?;
    let api: Arc<dyn PipedService> = Arc::new(
        ApiClient::connect(
            &cfg.api_address,
            &cfg.project_id,
            &cfg.piped_id,
            piped_key.trim(),
            apiclient::client::ApiClientOptions {
                insecure: options.insecure,
                cert_file: options.cert_file.clone(),
            },
        )
        .await?,
    );

    // Send the newest piped meta to the control plane before serving.
    report_piped_meta(api.clone(), &cfg).await?;

    // Admin server.
    {
        let handle = admin::serve(
            options.admin_port,
            prometheus.clone(),
            shutdown_future(&shutdown_tx),
        )
        .await?;
        set.spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipedError::ServerError(e.to_string())),
            };
            ("admin server", result)
        });
    }

    // Stats reporter.
    {
        let reporter = StatsReporter::new(
            options.admin_port,
            api.clone(),
            statsreporter::DEFAULT_INTERVAL,
        );
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "stats reporter",
                reporter.run(tokio::time::sleep, shutdown).await,
            )
        });
    }

    // Git client owning the per-repo working directories.
    let git = Arc::new(GitClient::new(
        cfg.git.username.clone(),
        cfg.git.email.clone(),
        options.work_dir.join("repos"),
    ));

    // Environment store: pull-through TTL cache plus its purge loop.
    let environment_store = Arc::new(EnvironmentStore::new(
        api.clone(),
        environmentstore::DEFAULT_TTL,
    ));
    {
        let store = environment_store.clone();
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            store
                .cache()
                .run_purger(environmentstore::PURGE_INTERVAL, tokio::time::sleep, shutdown)
                .await;
            ("environment store", Ok(()))
        });
    }

    // Notifier.
    let notifier = Arc::new(
        Notifier::new(cfg.notifications.clone()).with_environment_store(environment_store.clone()),
    );
    {
        let notifier = notifier.clone();
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move { ("notifier", notifier.run(shutdown).await) });
    }

    // Entity stores.
    let application_store = Arc::new(ApplicationStore::new(api.clone(), DEFAULT_SYNC_INTERVAL));
    let application_lister = ApplicationLister::new(application_store.clone());
    {
        let store = application_store.clone();
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "application store",
                store.run(tokio::time::sleep, shutdown).await,
            )
        });
    }

    let deployment_store = Arc::new(DeploymentStore::new(api.clone(), DEFAULT_SYNC_INTERVAL));
    let deployment_lister = DeploymentLister::new(deployment_store.clone());
    {
        let store = deployment_store.clone();
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "deployment store",
                store.run(tokio::time::sleep, shutdown).await,
            )
        });
    }

    let command_store = Arc::new(CommandStore::new(api.clone(), DEFAULT_SYNC_INTERVAL));
    let command_lister = CommandLister::new(command_store.clone());
    {
        let store = command_store.clone();
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "command store",
                store.run(tokio::time::sleep, shutdown).await,
            )
        });
    }

    let event_store = Arc::new(EventStore::new(api.clone(), DEFAULT_SYNC_INTERVAL));
    {
        let store = event_store.clone();
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move { ("event store", store.run(tokio::time::sleep, shutdown).await) });
    }

    // Cloud providers and shared caches.
    let providers = Arc::new(ProviderRegistry::from_spec(&cfg, tools.clone()));
    let manifests_cache = Arc::new(SingleflightCache::new(MANIFESTS_CACHE_TTL));

    // Live state store and reporter.
    let livestate_store = Arc::new(LiveStateStore::new(
        application_lister.clone(),
        providers.clone(),
        livestatestore::DEFAULT_REFRESH_INTERVAL,
    ));
    let live_getter = livestate_store.getter();
    {
        let store = livestate_store.clone();
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "live state store",
                store.run(tokio::time::sleep, shutdown).await,
            )
        });
    }
    {
        let reporter = LiveStateReporter::new(
            api.clone(),
            live_getter.clone(),
            livestate_store.events(),
            livestatereporter::DEFAULT_FLUSH_INTERVAL,
        );
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "live state reporter",
                reporter.run(tokio::time::sleep, shutdown).await,
            )
        });
    }

    // Sealed secret decrypter, validated before any deployment runs.
    let decrypter = sealedsecret::build_decrypter(cfg.sealed_secret_management.as_ref()).await?;

    // Drift detector.
    {
        let detector = DriftDetector::new(
            api.clone(),
            git.clone(),
            application_lister.clone(),
            deployment_lister.clone(),
            live_getter,
            providers.clone(),
            notifier.clone(),
            cfg.clone(),
            driftdetector::DEFAULT_INTERVAL,
        );
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "drift detector",
                detector.run(tokio::time::sleep, shutdown).await,
            )
        });
    }

    // Deployment controller.
    {
        let controller = Controller::new(
            api.clone(),
            git.clone(),
            application_lister.clone(),
            deployment_lister.clone(),
            command_lister.clone(),
            Arc::new(PlannerRegistry::default_registry()),
            Arc::new(ExecutorRegistry::default_registry()),
            providers.clone(),
            notifier.clone(),
            decrypter,
            cfg.clone(),
            manifests_cache,
            options.work_dir.join("deploys"),
        );
        let grace_period = options.grace_period;
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move {
            (
                "controller",
                controller
                    .run(grace_period, tokio::time::sleep, shutdown)
                    .await,
            )
        });
    }

    // Deployment trigger.
    {
        let trigger = Trigger::new(
            api.clone(),
            git.clone(),
            application_lister,
            deployment_lister,
            command_lister,
            notifier,
            cfg.clone(),
            cfg.sync_interval.as_duration(),
        );
        let shutdown = shutdown_future(&shutdown_tx);
        set.spawn(async move { ("trigger", trigger.run(tokio::time::sleep, shutdown).await) });
    }

    // Wait until shutdown or the first component failure. All components
    // stay up or none do.
    let failure: Option<(&'static str, PipedError)> = tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, stopping all components...");
            None
        }
        Some(joined) = set.join_next() => {
            match joined {
                Ok((name, Ok(()))) => Some((
                    name,
                    PipedError::Internal(format!("{} exited unexpectedly", name)),
                )),
                Ok((name, Err(e))) => Some((name, e)),
                Err(e) => Some(("component", PipedError::Internal(format!("panicked: {}", e)))),
            }
        }
    };

    let _ = shutdown_tx.send(());
    let drain = async {
        while set.join_next().await.is_some() {}
    };
    if tokio::time::timeout(options.grace_period, drain).await.is_err() {
        error!(
            "Components did not stop within {:?}, aborting",
            options.grace_period
        );
        set.abort_all();
    }

    if let Err(e) = git.clean().await {
        error!("Failed to clean git working directories: {}", e);
    }

    match failure {
        Some((name, e)) => {
            error!("Component {} failed: {}", name, e);
            Err(e)
        }
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

async fn add_chart_repositories(
    tools: &ToolRegistry,
    repos: &[crate::config::ChartRepository],
) -> Result<(), PipedError> {
    if repos.is_empty() {
        return Ok(());
    }
    let helm = tools.ensure("helm", "").await?;
    for repo in repos {
        info!("Adding chart repository {}", repo.name);
        crate::cloudprovider::run_tool(
            &helm,
            None,
            &["repo", "add", &repo.name, &repo.address],
            None,
        )
        .await?;
    }
    crate::cloudprovider::run_tool(&helm, None, &["repo", "update"], None).await?;
    Ok(())
}

async fn report_piped_meta(
    api: Arc<dyn PipedService>,
    cfg: &crate::config::PipedSpec,
) -> Result<(), PipedError> {
    let repositories = cfg
        .repositories
        .iter()
        .map(|r| PipedRepository {
            id: r.repo_id.clone(),
            remote: r.remote.clone(),
            branch: r.branch.clone(),
        })
        .collect();
    let cloud_providers = cfg
        .cloud_providers
        .iter()
        .map(|p| PipedCloudProvider {
            name: p.name.clone(),
            kind: serde_json::to_string(&p.kind)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
        })
        .collect();

    let sealed_secret_encryption = match &cfg.sealed_secret_management {
        Some(ssm)
            if ssm.kind == crate::config::piped::SealedSecretManagementKind::SealingKey =>
        {
            let public_key = tokio::fs::read_to_string(&ssm.public_key_file)
                .await
                .map_err(|e| {
                    PipedError::ConfigError(format!(
                        "failed to read public key for sealed secret management: {}",
                        e
                    ))
                })?;
            Some(SealedSecretEncryption {
                kind: "SEALING_KEY".to_string(),
                public_key: public_key.trim().to_string(),
            })
        }
        _ => Some(SealedSecretEncryption {
            kind: "NONE".to_string(),
            public_key: String::new(),
        }),
    };

    let request = ReportPipedMetaRequest {
        version: crate::version::get().version,
        repositories,
        cloud_providers,
        sealed_secret_encryption,
    };

    let retry = RetryPolicy::default();
    retry
        .run(|| {
            let api = api.clone();
            let request = request.clone();
            async move { api.report_piped_meta(request).await }
        })
        .await
}

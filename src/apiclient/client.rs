//! HTTP implementation of the control-plane API

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error};

use super::{
    make_piped_token, ApplicationLiveStateEvent, LogBlock, PipedService, ReportPipedMetaRequest,
};
use crate::errors::PipedError;
use crate::model::{
    Application, ApplicationSyncState, Command, Deployment, DeploymentStatus, Environment, Event,
    Stage, StageStatus,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for constructing an [`ApiClient`].
#[derive(Debug, Clone, Default)]
pub struct ApiClientOptions {
    /// Disable transport security; the address is dialed over plain HTTP
    pub insecure: bool,
    /// Path to a PEM certificate to trust instead of the system store
    pub cert_file: Option<String>,
}

/// API client attaching the piped token to every request.
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create a client and verify connectivity within the dial timeout.
    pub async fn connect(
        address: &str,
        project_id: &str,
        piped_id: &str,
        piped_key: &str,
        options: ApiClientOptions,
    ) -> Result<Self, PipedError> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(cert_file) = &options.cert_file {
            let pem = tokio::fs::read(cert_file).await?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| PipedError::ConfigError(format!("invalid cert file: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build()?;

        let scheme = if options.insecure { "http" } else { "https" };
        let base_url = format!("{}://{}", scheme, address.trim_end_matches('/'));
        let token = make_piped_token(project_id, piped_id, piped_key);

        let api = Self {
            client,
            base_url,
            token,
        };

        // First dial blocks until the control plane answers or the timeout.
        tokio::time::timeout(DIAL_TIMEOUT, api.ping())
            .await
            .map_err(|_| {
                PipedError::ApiError(format!(
                    "timed out dialing control plane at {}",
                    api.base_url
                ))
            })??;

        Ok(api)
    }

    async fn ping(&self) -> Result<(), PipedError> {
        self.call::<_, Empty>("Ping", &Empty {}).await?;
        Ok(())
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T, PipedError> {
        let url = format!("{}/api/piped/v1/{}", self.base_url, method);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PipedError::NotFound(method.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("{} failed: {} - {}", method, status, body);
            return Err(PipedError::ApiError(format!(
                "{}: {} {}",
                method, status, body
            )));
        }

        let body = response.json().await?;
        Ok(body)
    }
}

#[derive(Serialize, Deserialize)]
struct Empty {}

#[derive(Serialize)]
struct ByName<'a> {
    name: &'a str,
    labels: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct ById<'a> {
    id: &'a str,
}

#[derive(Deserialize)]
struct ApplicationList {
    applications: Vec<Application>,
}

#[derive(Deserialize)]
struct DeploymentList {
    deployments: Vec<Deployment>,
}

#[derive(Deserialize)]
struct CommandList {
    commands: Vec<Command>,
}

#[derive(Deserialize)]
struct EventList {
    events: Vec<Event>,
}

#[async_trait]
impl PipedService for ApiClient {
    async fn report_piped_meta(&self, req: ReportPipedMetaRequest) -> Result<(), PipedError> {
        self.call::<_, Empty>("ReportPipedMeta", &req).await?;
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, PipedError> {
        let list: ApplicationList = self.call("ListApplications", &Empty {}).await?;
        Ok(list.applications)
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError> {
        let list: DeploymentList = self.call("ListNotCompletedDeployments", &Empty {}).await?;
        Ok(list.deployments)
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError> {
        let list: CommandList = self.call("ListUnhandledCommands", &Empty {}).await?;
        Ok(list.commands)
    }

    async fn list_events(&self) -> Result<Vec<Event>, PipedError> {
        let list: EventList = self.call("ListEvents", &Empty {}).await?;
        Ok(list.events)
    }

    async fn get_latest_event(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Event, PipedError> {
        self.call("GetLatestEvent", &ByName { name, labels }).await
    }

    async fn get_environment(&self, id: &str) -> Result<Environment, PipedError> {
        self.call("GetEnvironment", &ById { id }).await
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req {
            deployment: Deployment,
        }
        self.call::<_, Empty>("CreateDeployment", &Req { deployment })
            .await?;
        Ok(())
    }

    async fn report_deployment_planned(
        &self,
        deployment_id: &str,
        summary: &str,
        stages: Vec<Stage>,
        running_commit_hash: &str,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            deployment_id: &'a str,
            summary: &'a str,
            stages: Vec<Stage>,
            running_commit_hash: &'a str,
        }
        self.call::<_, Empty>(
            "ReportDeploymentPlanned",
            &Req {
                deployment_id,
                summary,
                stages,
                running_commit_hash,
            },
        )
        .await?;
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            deployment_id: &'a str,
            status: DeploymentStatus,
            status_reason: &'a str,
        }
        self.call::<_, Empty>(
            "ReportDeploymentStatusChanged",
            &Req {
                deployment_id,
                status,
                status_reason: reason,
            },
        )
        .await?;
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_id: &str,
        status: StageStatus,
        reason: &str,
        retried_count: u32,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            deployment_id: &'a str,
            stage_id: &'a str,
            status: StageStatus,
            status_reason: &'a str,
            retried_count: u32,
        }
        self.call::<_, Empty>(
            "ReportStageStatusChanged",
            &Req {
                deployment_id,
                stage_id,
                status,
                status_reason: reason,
                retried_count,
            },
        )
        .await?;
        Ok(())
    }

    async fn report_deployment_completed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        stage_statuses: HashMap<String, StageStatus>,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            deployment_id: &'a str,
            status: DeploymentStatus,
            status_reason: &'a str,
            stage_statuses: HashMap<String, StageStatus>,
        }
        self.call::<_, Empty>(
            "ReportDeploymentCompleted",
            &Req {
                deployment_id,
                status,
                status_reason: reason,
                stage_statuses,
            },
        )
        .await?;
        Ok(())
    }

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: ApplicationSyncState,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            application_id: &'a str,
            state: ApplicationSyncState,
        }
        self.call::<_, Empty>(
            "ReportApplicationSyncState",
            &Req {
                application_id,
                state,
            },
        )
        .await?;
        Ok(())
    }

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            deployment_id: &'a str,
            metadata: HashMap<String, String>,
        }
        self.call::<_, Empty>(
            "SaveDeploymentMetadata",
            &Req {
                deployment_id,
                metadata,
            },
        )
        .await?;
        Ok(())
    }

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            deployment_id: &'a str,
            stage_id: &'a str,
            metadata: HashMap<String, String>,
        }
        self.call::<_, Empty>(
            "SaveStageMetadata",
            &Req {
                deployment_id,
                stage_id,
                metadata,
            },
        )
        .await?;
        Ok(())
    }

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        blocks: Vec<LogBlock>,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            deployment_id: &'a str,
            stage_id: &'a str,
            blocks: Vec<LogBlock>,
        }
        self.call::<_, Empty>(
            "ReportStageLogs",
            &Req {
                deployment_id,
                stage_id,
                blocks,
            },
        )
        .await?;
        Ok(())
    }

    async fn report_application_live_state_events(
        &self,
        events: Vec<ApplicationLiveStateEvent>,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req {
            events: Vec<ApplicationLiveStateEvent>,
        }
        self.call::<_, Empty>("AppendApplicationLiveStateEvents", &Req { events })
            .await?;
        Ok(())
    }

    async fn report_command_handled(&self, command_id: &str) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req<'a> {
            command_id: &'a str,
        }
        self.call::<_, Empty>("ReportCommandHandled", &Req { command_id })
            .await?;
        Ok(())
    }

    async fn report_stats(&self, piped_stats: String) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Req {
            piped_stats: String,
        }
        self.call::<_, Empty>("ReportStats", &Req { piped_stats })
            .await?;
        Ok(())
    }
}

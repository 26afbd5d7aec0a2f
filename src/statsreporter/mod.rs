//! Stats reporter
//!
//! Periodically scrapes the local admin `/metrics` endpoint and ships the
//! exposition snapshot to the control plane, where it feeds the piped
//! health views.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::apiclient::PipedService;
use crate::errors::PipedError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub struct StatsReporter {
    metrics_url: String,
    api: Arc<dyn PipedService>,
    client: reqwest::Client,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(admin_port: u16, api: Arc<dyn PipedService>, interval: Duration) -> Self {
        Self {
            metrics_url: format!("http://localhost:{}/metrics", admin_port),
            api,
            client: reqwest::Client::new(),
            interval,
        }
    }

    pub async fn run<S, F>(
        &self,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), PipedError>
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!("Stats reporter starting...");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Stats reporter shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(self.interval) => {}
            }

            let stats = match self.scrape().await {
                Ok(stats) => stats,
                Err(e) => {
                    error!("Failed to scrape local metrics: {}", e);
                    continue;
                }
            };
            debug!("Reporting {} bytes of metrics", stats.len());
            if let Err(e) = self.api.report_stats(stats).await {
                error!("Failed to report stats: {}", e);
            }
        }
    }

    async fn scrape(&self) -> Result<String, PipedError> {
        let response = self
            .client
            .get(&self.metrics_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        Ok(response.text().await?)
    }
}

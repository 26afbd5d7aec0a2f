//! Live-state reporter
//!
//! Streams live-state change events to the control plane as they arrive on
//! the store's channel, and periodically ships a full snapshot so that a
//! dropped event never leaves the console permanently stale.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::apiclient::{ApplicationLiveStateEvent, PipedService};
use crate::errors::PipedError;
use crate::livestatestore::{LiveStateGetter, Snapshot};
use crate::queue::BoundedQueue;

/// How often the full snapshot set is flushed regardless of events.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Largest batch shipped in one report call.
const MAX_BATCH: usize = 64;

pub struct LiveStateReporter {
    api: Arc<dyn PipedService>,
    getter: LiveStateGetter,
    events: Arc<BoundedQueue<Arc<Snapshot>>>,
    flush_interval: Duration,
}

impl LiveStateReporter {
    pub fn new(
        api: Arc<dyn PipedService>,
        getter: LiveStateGetter,
        events: Arc<BoundedQueue<Arc<Snapshot>>>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            api,
            getter,
            events,
            flush_interval,
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
        info!("Live state reporter starting...");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Live state reporter shutting down...");
                    return Ok(());
                }
                _ = self.events.wait() => {
                    self.flush_events().await;
                }
                _ = sleep_fn(self.flush_interval) => {
                    self.flush_full().await;
                }
            }
        }
    }

    async fn flush_events(&self) {
        let snapshots = self.events.drain(MAX_BATCH);
        if snapshots.is_empty() {
            return;
        }
        let events: Vec<ApplicationLiveStateEvent> =
            snapshots.iter().map(|s| to_event(s)).collect();
        debug!("Reporting {} live state events", events.len());
        if let Err(e) = self.api.report_application_live_state_events(events).await {
            // Best effort; the periodic full flush repairs any gap.
            error!("Failed to report live state events: {}", e);
        }
    }

    async fn flush_full(&self) {
        let snapshots = self.getter.list();
        if snapshots.is_empty() {
            return;
        }
        let events: Vec<ApplicationLiveStateEvent> =
            snapshots.iter().map(|s| to_event(s)).collect();
        debug!("Reporting full live state of {} applications", events.len());
        if let Err(e) = self.api.report_application_live_state_events(events).await {
            error!("Failed to report full live state: {}", e);
        }
    }
}

fn to_event(snapshot: &Snapshot) -> ApplicationLiveStateEvent {
    ApplicationLiveStateEvent {
        application_id: snapshot.application_id.clone(),
        env_id: snapshot.env_id.clone(),
        kind: snapshot.kind,
        version: snapshot.version,
        resources: snapshot.resources.clone(),
        timestamp: snapshot.taken_at,
    }
}

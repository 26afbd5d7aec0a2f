//! Stage log persister
//!
//! Logs are local-first: appended to an in-memory buffer immediately, then
//! streamed to the control plane on flush. A reporter outage never loses
//! user-visible output because unflushed blocks stay buffered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};

use crate::apiclient::{LogBlock, LogSeverity, PipedService};
use crate::errors::PipedError;

pub struct StageLogPersister {
    api: Arc<dyn PipedService>,
    deployment_id: String,
    stage_id: String,
    blocks: Mutex<Vec<LogBlock>>,
    /// Number of blocks already shipped
    flushed: AtomicU64,
    next_index: AtomicU64,
}

impl StageLogPersister {
    pub fn new(api: Arc<dyn PipedService>, deployment_id: &str, stage_id: &str) -> Self {
        Self {
            api,
            deployment_id: deployment_id.to_string(),
            stage_id: stage_id.to_string(),
            blocks: Mutex::new(Vec::new()),
            flushed: AtomicU64::new(0),
            next_index: AtomicU64::new(0),
        }
    }

    pub fn info(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Info);
    }

    pub fn success(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Success);
    }

    pub fn error(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Error);
    }

    fn append(&self, log: String, severity: LogSeverity) {
        debug!("[{}/{}] {}", self.deployment_id, self.stage_id, log);
        let block = LogBlock {
            index: self.next_index.fetch_add(1, Ordering::SeqCst),
            log,
            severity,
            created_at: Utc::now(),
        };
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        blocks.push(block);
    }

    /// Stream the blocks appended since the last successful flush.
    pub async fn flush(&self) -> Result<(), PipedError> {
        let pending: Vec<LogBlock> = {
            let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
            let from = self.flushed.load(Ordering::SeqCst) as usize;
            blocks[from..].to_vec()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let count = pending.len() as u64;
        match self
            .api
            .report_stage_logs(&self.deployment_id, &self.stage_id, pending)
            .await
        {
            Ok(()) => {
                self.flushed.fetch_add(count, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to flush {} log blocks of stage {}: {}",
                    count, self.stage_id, e
                );
                Err(e)
            }
        }
    }
}

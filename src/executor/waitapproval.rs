//! WaitApproval stage executor
//!
//! Ticks until a user with approval rights issues an ApproveStage command,
//! recording the approver in the stage metadata, or until the configured
//! timeout elapses.

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::{Executor, ExecutorInput, StageResult, StopSignal};
use crate::config::{StageOptions, WaitApprovalStageOptions};

/// Metadata key recording who approved the stage.
pub const APPROVED_BY_KEY: &str = "approved-by";

pub struct WaitApprovalExecutor {}

impl WaitApprovalExecutor {
    pub fn new() -> Self {
        Self {}
    }

    fn options(input: &ExecutorInput) -> WaitApprovalStageOptions {
        match input.stage_config.as_ref().map(|c| &c.options) {
            Some(StageOptions::WaitApproval(opts)) => opts.clone(),
            _ => WaitApprovalStageOptions {
                timeout: crate::config::ConfigDuration::from_secs(6 * 3600),
                approvers: Vec::new(),
            },
        }
    }
}

impl Default for WaitApprovalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for WaitApprovalExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        if sig.signal().is_cancel() {
            return StageResult::Cancelled;
        }

        let options = Self::options(input);

        // An approval command for this stage ends the wait.
        for command in input
            .command_lister
            .list_deployment_commands(&input.deployment.id)
        {
            if !command.approves_stage(&input.deployment.id, &input.stage.id) {
                continue;
            }
            if !options.approvers.is_empty() && !options.approvers.contains(&command.commander) {
                input.log.info(format!(
                    "{} is not among the allowed approvers",
                    command.commander
                ));
                if let Err(e) = input.command_lister.mark_handled(&command.id).await {
                    warn!("Failed to acknowledge command {}: {}", command.id, e);
                }
                continue;
            }

            if let Err(e) = input
                .metadata
                .set_stage(&input.stage.id, APPROVED_BY_KEY, &command.commander)
                .await
            {
                warn!("Failed to save the approver metadata: {}", e);
            }
            if let Err(e) = input.command_lister.mark_handled(&command.id).await {
                warn!("Failed to acknowledge command {}: {}", command.id, e);
            }
            input
                .log
                .success(format!("Approved by {}", command.commander));
            return StageResult::Success;
        }

        let elapsed = Utc::now().signed_duration_since(input.stage.created_at);
        let timeout = chrono::Duration::from_std(options.timeout.as_duration())
            .unwrap_or_else(|_| chrono::Duration::hours(6));
        if elapsed > timeout {
            input.log.error("Timed out while waiting for approval");
            return StageResult::Failure("approval timeout".to_string());
        }

        input.log.info("Waiting for an approval...");
        StageResult::Exited
    }
}

//! Wait stage executor

use async_trait::async_trait;

use super::{Executor, ExecutorInput, StageResult, StopSignal};
use crate::config::StageOptions;

pub struct WaitExecutor {}

impl WaitExecutor {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for WaitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for WaitExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        let duration = match input.stage_config.as_ref().map(|c| &c.options) {
            Some(StageOptions::Wait(opts)) => opts.duration.as_duration(),
            _ => std::time::Duration::ZERO,
        };
        if duration.is_zero() {
            return StageResult::Success;
        }

        input
            .log
            .info(format!("Waiting for {} seconds...", duration.as_secs()));

        tokio::select! {
            _ = sig.stopped() => {
                if sig.signal().is_cancel() {
                    return StageResult::Cancelled;
                }
                StageResult::Exited
            }
            _ = tokio::time::sleep(duration) => {
                input.log.success("Wait completed");
                StageResult::Success
            }
        }
    }
}

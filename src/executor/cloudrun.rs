//! Cloud Run stage executors

use async_trait::async_trait;

use super::{apply_target, rollback_to_running, Executor, ExecutorInput, StageResult, StopSignal};
use crate::config::StageOptions;
use crate::model::StageName;

pub struct CloudRunExecutor {}

impl CloudRunExecutor {
    pub fn new() -> Self {
        Self {}
    }

    async fn ensure_promote(&self, input: &ExecutorInput) -> StageResult {
        let percent = match input.stage_config.as_ref().map(|c| &c.options) {
            Some(StageOptions::CloudRunPromote(opts)) if opts.percent > 0 => opts.percent,
            _ => 100,
        };

        input
            .log
            .info(format!("Promoting {}% of traffic to the new revision...", percent));
        if let Err(e) = input
            .provider
            .promote(&input.target_dir, &input.app_spec, percent)
            .await
        {
            input.log.error(format!("Failed to promote: {}", e));
            return StageResult::Failure(format!("failed to promote: {}", e));
        }
        input.log.success("Successfully promoted the new revision");
        StageResult::Success
    }
}

impl Default for CloudRunExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for CloudRunExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        match input.stage.name {
            StageName::CloudRunSync => apply_target(input, &sig).await,
            StageName::CloudRunPromote => self.ensure_promote(input).await,
            StageName::Rollback => rollback_to_running(input).await,
            other => StageResult::Failure(format!(
                "unsupported stage {} for a cloud run application",
                other
            )),
        }
    }
}

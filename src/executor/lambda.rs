//! Lambda stage executors

use async_trait::async_trait;

use super::{apply_target, rollback_to_running, Executor, ExecutorInput, StageResult, StopSignal};
use crate::config::StageOptions;
use crate::model::StageName;

pub struct LambdaExecutor {}

impl LambdaExecutor {
    pub fn new() -> Self {
        Self {}
    }

    async fn ensure_promote(&self, input: &ExecutorInput) -> StageResult {
        let percent = match input.stage_config.as_ref().map(|c| &c.options) {
            Some(StageOptions::LambdaPromote(opts)) if opts.percent > 0 => opts.percent,
            _ => 100,
        };

        input
            .log
            .info(format!("Routing {}% of traffic to the new version...", percent));
        if let Err(e) = input
            .provider
            .promote(&input.target_dir, &input.app_spec, percent)
            .await
        {
            input.log.error(format!("Failed to promote: {}", e));
            return StageResult::Failure(format!("failed to promote: {}", e));
        }
        input.log.success("Successfully promoted the new version");
        StageResult::Success
    }
}

impl Default for LambdaExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for LambdaExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        match input.stage.name {
            // Canary rollout publishes the new code; traffic moves on promote.
            StageName::LambdaSync | StageName::LambdaCanaryRollout => {
                apply_target(input, &sig).await
            }
            StageName::LambdaPromote => self.ensure_promote(input).await,
            StageName::Rollback => rollback_to_running(input).await,
            other => StageResult::Failure(format!(
                "unsupported stage {} for a lambda application",
                other
            )),
        }
    }
}

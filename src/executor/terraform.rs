//! Terraform stage executors

use async_trait::async_trait;

use super::{apply_target, rollback_to_running, Executor, ExecutorInput, StageResult, StopSignal};
use crate::model::StageName;

pub struct TerraformExecutor {}

impl TerraformExecutor {
    pub fn new() -> Self {
        Self {}
    }

    /// Render the plan into the stage log without mutating anything.
    async fn ensure_plan(&self, input: &ExecutorInput) -> StageResult {
        input.log.info("Running terraform plan...");
        match input
            .provider
            .preview(&input.target_dir, &input.app_spec)
            .await
        {
            Ok(out) => {
                input.log.info(out);
                input.log.success("Successfully planned the changes");
                StageResult::Success
            }
            Err(e) => {
                input.log.error(format!("Failed to plan: {}", e));
                StageResult::Failure(format!("failed to plan: {}", e))
            }
        }
    }
}

impl Default for TerraformExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for TerraformExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        match input.stage.name {
            StageName::TerraformSync | StageName::TerraformApply => {
                apply_target(input, &sig).await
            }
            StageName::TerraformPlan => self.ensure_plan(input).await,
            StageName::Rollback => rollback_to_running(input).await,
            other => StageResult::Failure(format!(
                "unsupported stage {} for a terraform application",
                other
            )),
        }
    }
}

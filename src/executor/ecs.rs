//! ECS stage executors

use async_trait::async_trait;

use super::{apply_target, rollback_to_running, Executor, ExecutorInput, StageResult, StopSignal};
use crate::model::StageName;

pub struct EcsExecutor {}

impl EcsExecutor {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for EcsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for EcsExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        match input.stage.name {
            StageName::EcsSync => apply_target(input, &sig).await,
            StageName::Rollback => rollback_to_running(input).await,
            other => StageResult::Failure(format!(
                "unsupported stage {} for an ecs application",
                other
            )),
        }
    }
}

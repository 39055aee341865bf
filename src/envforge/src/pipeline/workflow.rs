/// Task workflow executor.
///
/// Runs a sequence of ExecTasks inside one environment with progress
/// reporting, stopping at the first failure.
use super::tasks::ExecTask;
use crate::common::{CommandBridge, ExecResult, Stage, Target};
use crate::provisioner::{ProvisionError, StageFailure};
use std::sync::Arc;

/// Outcome of one command within a stage. Consumed immediately, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    pub exit_code: i32,
    pub message: String,
}

impl StageResult {
    pub fn from_exec(stage: Stage, what: &str, result: &ExecResult) -> Self {
        let message = if result.success() {
            format!("{} completed", what)
        } else {
            format!("{}: {}", what, result.last_line())
        };
        Self {
            stage,
            success: result.success(),
            exit_code: result.exit_code,
            message,
        }
    }

    pub fn into_result(self) -> Result<(), StageFailure> {
        if self.success {
            Ok(())
        } else {
            Err(StageFailure::new(self.stage, Some(self.exit_code), self.message))
        }
    }
}

/// Runs tasks against a fixed target through the command bridge.
pub struct TaskExecutor {
    pub bridge: Arc<dyn CommandBridge>,
    pub target: Target,
}

impl TaskExecutor {
    pub fn new(bridge: Arc<dyn CommandBridge>, target: Target) -> Self {
        Self { bridge, target }
    }

    /// Execute a single task. Only a launch failure is an error here.
    pub async fn execute(&self, stage: Stage, task: &ExecTask) -> Result<ExecResult, ProvisionError> {
        tracing::info!(
            "[TaskExecutor] Executing task '{}' on {}",
            task.display_name(),
            self.target
        );
        let result = self
            .bridge
            .run(&self.target, &task.command)
            .await
            .map_err(|source| ProvisionError::Bridge { stage, source })?;

        if result.success() {
            tracing::info!(
                "[TaskExecutor] Task '{}' completed successfully",
                task.display_name()
            );
        } else {
            tracing::error!(
                "[TaskExecutor] Task '{}' failed (exit {}): {}",
                task.display_name(),
                result.exit_code,
                result.last_line()
            );
        }
        Ok(result)
    }
}

/// Execute tasks in order with progress tracking.
/// Fail-fast: stops on the first task failure.
pub async fn run_tasks<F>(
    tasks: &[ExecTask],
    executor: &TaskExecutor,
    stage: Stage,
    progress_start: u32,
    progress_end: u32,
    progress_fn: F,
) -> Result<(), ProvisionError>
where
    F: Fn(u32, &str, &str),
{
    if tasks.is_empty() {
        return Ok(());
    }

    let total_tasks = tasks.len() as u32;
    let span = progress_end.saturating_sub(progress_start);

    for (index, task) in tasks.iter().enumerate() {
        let progress = progress_start + span.saturating_mul(index as u32) / total_tasks;
        let display_name = task.display_name();

        progress_fn(progress, &format!("Executing {}", display_name), &display_name);

        let task_start = std::time::Instant::now();
        let result = executor.execute(stage, task).await?;
        let task_duration = task_start.elapsed();

        let outcome = StageResult::from_exec(stage, &format!("Task '{}'", display_name), &result);
        if !outcome.success {
            tracing::warn!(
                "[TIMING] Task {} failed after {}ms",
                display_name,
                task_duration.as_millis()
            );
        }
        outcome.into_result()?;

        tracing::info!(
            "[TIMING] Task {} completed in {}ms",
            display_name,
            task_duration.as_millis()
        );

        let completion_progress = if index + 1 < tasks.len() {
            progress_start + span.saturating_mul((index + 1) as u32) / total_tasks
        } else {
            progress_end
        };
        progress_fn(
            completion_progress,
            &format!("Completed {}", display_name),
            &display_name,
        );
    }

    Ok(())
}

//! Execution state machine for workflows and their tasks.

use crate::error::{WorkflowError, WorkflowResult};
use crate::scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Execution state for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Admitted, not yet driven.
    Pending,

    /// The driver is scheduling tasks.
    Running,

    /// Every task reached a successful terminal state.
    Completed,

    /// The execution failed.
    Failed,

    /// The execution was cancelled.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Validates a state transition.
    pub fn can_transition_to(&self, next: &ExecutionStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (ExecutionStatus::Pending, ExecutionStatus::Running) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Failed) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Cancelled) => true,
            (ExecutionStatus::Running, ExecutionStatus::Completed) => true,
            (ExecutionStatus::Running, ExecutionStatus::Failed) => true,
            (ExecutionStatus::Running, ExecutionStatus::Cancelled) => true,
            _ => false,
        }
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting on dependencies or a gate.
    Pending,

    /// A dispatch attempt is in flight.
    Running,

    /// The task produced its output.
    Completed,

    /// The task failed terminally.
    Failed,

    /// The task was cancelled mid-flight.
    Cancelled,

    /// The task is waiting out a retry backoff.
    Retrying,

    /// The task will never run (unsatisfied branch or failed ancestor).
    Skipped,
}

impl TaskStatus {
    /// Returns true if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Skipped
        )
    }

    /// Validates a state transition.
    ///
    /// `failed -> pending` is the one legal re-entry, used by the global
    /// `retry` error strategy to reschedule a failed task.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Skipped) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Retrying) => true,
            (TaskStatus::Running, TaskStatus::Cancelled) => true,
            (TaskStatus::Retrying, TaskStatus::Running) => true,
            (TaskStatus::Retrying, TaskStatus::Cancelled) => true,
            (TaskStatus::Retrying, TaskStatus::Failed) => true,
            (TaskStatus::Failed, TaskStatus::Pending) => true,
            _ => false,
        }
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task ID.
    pub task_id: String,

    /// Current status.
    pub status: TaskStatus,

    /// First dispatch time.
    pub started_at: Option<DateTime<Utc>>,

    /// Terminal transition time.
    pub ended_at: Option<DateTime<Utc>>,

    /// Number of retries consumed.
    pub retry_count: u32,

    /// Error string from the last failure.
    pub error: Option<String>,

    /// Output map captured from the backend response.
    pub output: HashMap<String, Value>,

    /// Custom metadata.
    pub metadata: HashMap<String, String>,
}

impl TaskRecord {
    /// Creates a pending record.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            started_at: None,
            ended_at: None,
            retry_count: 0,
            error: None,
            output: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Transitions to a new status, stamping timestamps.
    pub fn transition(&mut self, next: TaskStatus) -> WorkflowResult<()> {
        if !self.status.can_transition_to(&next) {
            return Err(WorkflowError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        match next {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            status if status.is_terminal() => {
                self.ended_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Marks the task running.
    pub fn start(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Running)
    }

    /// Marks the task completed with its output.
    pub fn complete(&mut self, output: HashMap<String, Value>) -> WorkflowResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.output = output;
        self.error = None;
        Ok(())
    }

    /// Marks the task failed.
    pub fn fail(&mut self, error: impl Into<String>) -> WorkflowResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Marks the task retrying, recording the attempt's error.
    pub fn retrying(&mut self, error: impl Into<String>) -> WorkflowResult<()> {
        self.transition(TaskStatus::Retrying)?;
        self.retry_count += 1;
        self.error = Some(error.into());
        Ok(())
    }

    /// Marks the task skipped.
    pub fn skip(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Skipped)
    }

    /// Marks the task cancelled.
    pub fn cancel(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Cancelled)
    }

    /// Resets a failed task to pending (global `retry` strategy).
    pub fn reset(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Pending)?;
        self.started_at = None;
        self.ended_at = None;
        self.error = None;
        self.output.clear();
        Ok(())
    }

    /// Gets the execution duration in milliseconds.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }
}

/// A single live instance of a workflow.
///
/// Owned by the registry; mutated exclusively through the executor driver
/// of the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Process-unique execution ID.
    pub execution_id: String,

    /// Workflow the execution runs.
    pub workflow_id: String,

    /// Correlation ID echoed from the inbound request.
    pub correlation_id: String,

    /// Current status.
    pub status: ExecutionStatus,

    /// Mutable variable scope (dotted-path keyed).
    pub variables: HashMap<String, Value>,

    /// Task records keyed by task ID.
    pub tasks: HashMap<String, TaskRecord>,

    /// Admission time.
    pub started_at: DateTime<Utc>,

    /// Terminal transition time.
    pub ended_at: Option<DateTime<Utc>>,

    /// Terminal error summary.
    pub error: Option<String>,

    /// Custom metadata.
    pub metadata: HashMap<String, String>,
}

impl WorkflowExecution {
    /// Creates a pending execution with a seeded variable scope.
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        correlation_id: impl Into<String>,
        variables: HashMap<String, Value>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            correlation_id: correlation_id.into(),
            status: ExecutionStatus::Pending,
            variables,
            tasks: HashMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Transitions to a new status, stamping the end time on terminal
    /// states.
    pub fn transition(&mut self, next: ExecutionStatus) -> WorkflowResult<()> {
        if !self.status.can_transition_to(&next) {
            return Err(WorkflowError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        tracing::debug!(
            "Execution {} transitioning from {} to {}",
            self.execution_id,
            self.status,
            next
        );

        self.status = next;
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Gets or lazily creates a task record.
    pub fn task_record(&mut self, task_id: &str) -> &mut TaskRecord {
        self.tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskRecord::new(task_id))
    }

    /// Records a successful task: stores the output, binds
    /// `tasks.<id>` in the scope and applies the alias map.
    pub fn record_task_success(
        &mut self,
        task_id: &str,
        output: HashMap<String, Value>,
        aliases: &HashMap<String, String>,
    ) -> WorkflowResult<()> {
        self.task_record(task_id).complete(output.clone())?;
        scope::bind_task_output(&mut self.variables, task_id, &output);
        scope::apply_aliases(&mut self.variables, aliases, &output);
        Ok(())
    }

    /// Gets the execution duration in milliseconds, up to now for live
    /// executions.
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    /// Gets the completion percentage (0-100) over known task records.
    pub fn completion_percentage(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        let terminal = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .count();
        (terminal as f64 / self.tasks.len() as f64) * 100.0
    }

    /// Gets counts of tasks by status.
    pub fn task_status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_transitions() {
        assert!(ExecutionStatus::Pending.can_transition_to(&ExecutionStatus::Running));
        assert!(ExecutionStatus::Running.can_transition_to(&ExecutionStatus::Completed));
        assert!(ExecutionStatus::Running.can_transition_to(&ExecutionStatus::Cancelled));
        assert!(!ExecutionStatus::Completed.can_transition_to(&ExecutionStatus::Running));
        assert!(!ExecutionStatus::Failed.can_transition_to(&ExecutionStatus::Running));
    }

    #[test]
    fn test_task_retry_cycle() {
        let mut record = TaskRecord::new("a");

        record.start().unwrap();
        record.retrying("boom").unwrap();
        assert_eq!(record.retry_count, 1);

        record.start().unwrap();
        record.complete(HashMap::new()).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.error.is_none());
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn test_illegal_task_transition_rejected() {
        let mut record = TaskRecord::new("a");
        record.start().unwrap();
        record.complete(HashMap::new()).unwrap();

        assert!(matches!(
            record.start(),
            Err(WorkflowError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_failed_task_can_reset() {
        let mut record = TaskRecord::new("a");
        record.start().unwrap();
        record.fail("boom").unwrap();

        record.reset().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.error.is_none());
        assert!(record.started_at.is_none());
    }

    #[test]
    fn test_record_task_success_binds_scope() {
        let mut execution =
            WorkflowExecution::new("exec-1", "w", "c1", HashMap::new());
        execution.task_record("a").start().unwrap();

        let mut output = HashMap::new();
        output.insert("nodes".to_string(), serde_json::json!([{"id": "n1"}]));
        let mut aliases = HashMap::new();
        aliases.insert("found_nodes".to_string(), "nodes".to_string());

        execution
            .record_task_success("a", output, &aliases)
            .unwrap();

        assert!(execution.variables.contains_key("tasks.a"));
        assert!(execution.variables.contains_key("found_nodes"));
        assert_eq!(execution.tasks["a"].status, TaskStatus::Completed);
    }

    #[test]
    fn test_completion_percentage() {
        let mut execution =
            WorkflowExecution::new("exec-1", "w", "c1", HashMap::new());
        execution.task_record("a").start().unwrap();
        execution.task_record("b");

        execution.tasks.get_mut("a").unwrap().complete(HashMap::new()).unwrap();
        assert_eq!(execution.completion_percentage(), 50.0);
    }
}

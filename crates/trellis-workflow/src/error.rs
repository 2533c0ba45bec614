//! Error types for the Trellis workflow engine.

use thiserror::Error;

/// Result type alias for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Main error type for the workflow engine.
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    /// Malformed inbound request, unknown template or schema violation.
    #[error("Invalid request: {0}")]
    Request(String),

    /// Admission rejected: execution capacity saturated.
    #[error("Execution capacity saturated: {running} of {max} slots in use")]
    RegistryBusy { running: usize, max: usize },

    /// Execution not found.
    #[error("Execution not found: {0}")]
    NotFound(String),

    /// Invalid workflow definition.
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// Cycle detected in the task dependency graph.
    #[error("Cycle detected in workflow task graph")]
    CycleDetected,

    /// Unresolved substitution or type mismatch while rendering parameters.
    #[error("Parameter error in task '{task_id}': {reason}")]
    Parameter { task_id: String, reason: String },

    /// Condition expression could not be parsed or evaluated.
    #[error("Condition error in task '{task_id}': {reason}")]
    Condition { task_id: String, reason: String },

    /// Downstream service reported failure or returned a bad payload.
    #[error("Backend failure in task '{task_id}': {reason}")]
    Backend { task_id: String, reason: String },

    /// A single dispatch attempt exceeded the per-task deadline.
    #[error("Task '{task_id}' timed out after {timeout_secs}s")]
    TaskTimeout { task_id: String, timeout_secs: u64 },

    /// The workflow deadline elapsed.
    #[error("Workflow execution timed out: {0}")]
    ExecutionTimeout(String),

    /// A cancellation signal was observed.
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    /// The execution already reached a terminal state.
    #[error("Execution already terminal: {0}")]
    AlreadyTerminal(String),

    /// Invalid state transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Retry attempts exhausted.
    #[error("Retry attempts exhausted for task: {0}")]
    RetryExhausted(String),

    /// Template not found.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Template rendering error.
    #[error("Template rendering error: {0}")]
    TemplateRender(String),

    /// Template store I/O error.
    #[error("Template store error: {0}")]
    TemplateStore(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violation.
    #[error("Internal workflow engine error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Returns true if the error is subject to the task retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Parameter { .. }
                | WorkflowError::Backend { .. }
                | WorkflowError::TaskTimeout { .. }
                | WorkflowError::Internal(_)
        )
    }

    /// Returns true if the error can never be healed by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::Request(_)
                | WorkflowError::InvalidDefinition(_)
                | WorkflowError::CycleDetected
                | WorkflowError::InvalidStateTransition { .. }
                | WorkflowError::AlreadyTerminal(_)
                | WorkflowError::TemplateNotFound(_)
                | WorkflowError::TemplateRender(_)
        )
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WorkflowError {
    fn from(err: serde_yaml::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

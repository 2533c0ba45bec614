//! Wire protocol payloads and channel names for the Trellis platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Channel carrying inbound workflow requests.
pub const WORKFLOW_REQUESTS: &str = "workflow-requests";

/// Channel carrying terminal workflow responses and query replies.
pub const WORKFLOW_RESPONSES: &str = "workflow-responses";

/// Discovery channel for capability announcements.
pub const CAPABILITY_ANNOUNCEMENTS: &str = "capability-announcements";

/// Request/response channel pair for one backend service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRoute {
    /// Channel the orchestrator publishes requests to.
    pub request: &'static str,

    /// Channel the service publishes responses to.
    pub response: &'static str,
}

/// Route to the data/graph service.
pub const DATA_ROUTE: ServiceRoute = ServiceRoute {
    request: "data-requests",
    response: "data-responses",
};

/// Route to the AI service.
pub const AI_ROUTE: ServiceRoute = ServiceRoute {
    request: "ai-requests",
    response: "ai-responses",
};

/// Route to the execution/sandbox service.
pub const EXEC_ROUTE: ServiceRoute = ServiceRoute {
    request: "exec-requests",
    response: "exec-responses",
};

/// All backend routes whose response channels need a correlation pump.
pub const SERVICE_ROUTES: [ServiceRoute; 3] = [DATA_ROUTE, AI_ROUTE, EXEC_ROUTE];

/// Operations accepted on the workflow request channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ExecuteWorkflow,
    GenerateAiWorkflow,
    GetExecutionStatus,
    CancelWorkflow,
    ListTemplates,
}

impl Default for Operation {
    fn default() -> Self {
        Operation::ExecuteWorkflow
    }
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ExecuteWorkflow => "execute_workflow",
            Operation::GenerateAiWorkflow => "generate_ai_workflow",
            Operation::GetExecutionStatus => "get_execution_status",
            Operation::CancelWorkflow => "cancel_workflow",
            Operation::ListTemplates => "list_templates",
        }
    }
}

/// Inbound workflow request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Correlation ID echoed on every response to this request.
    pub correlation_id: String,

    /// Requested operation; defaults to workflow execution.
    #[serde(default)]
    pub operation: Operation,

    /// Template to render. Required for execution unless the definition is
    /// AI-generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_template: Option<String>,

    /// Variable bindings merged over template defaults (caller wins).
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Opaque generation brief forwarded to the AI service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_from_ai: Option<Value>,

    /// Request priority.
    #[serde(default)]
    pub priority: i32,

    /// Target execution for status and cancel operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,

    /// Cancel without waiting for the shutdown grace period.
    #[serde(default)]
    pub force: bool,
}

impl WorkflowRequest {
    /// Creates an execution request for a template.
    pub fn execute(correlation_id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            operation: Operation::ExecuteWorkflow,
            workflow_template: Some(template.into()),
            variables: HashMap::new(),
            generate_from_ai: None,
            priority: 0,
            execution_id: None,
            force: false,
        }
    }

    /// Sets a variable binding.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// Final state summary for one task, embedded in a workflow response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultSummary {
    /// Terminal task status.
    pub status: String,

    /// Output map captured from the backend response.
    #[serde(default)]
    pub output: HashMap<String, Value>,

    /// Error string if the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Number of retries consumed.
    #[serde(default)]
    pub retry_count: u32,
}

/// Outbound workflow response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResponse {
    /// Correlation ID echoed from the request.
    pub correlation_id: String,

    /// Execution this response describes; empty for request-level failures.
    #[serde(default)]
    pub execution_id: String,

    /// Execution status at the time of the response.
    pub status: String,

    /// True only for a completed execution or a successful query.
    pub success: bool,

    /// Result payload; final variable scope for terminal responses.
    #[serde(default)]
    pub results: HashMap<String, Value>,

    /// Human-readable failure summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human-readable execution duration.
    #[serde(default)]
    pub duration: String,

    /// Final state per task.
    #[serde(default)]
    pub task_results: HashMap<String, TaskResultSummary>,

    /// Response emission time (RFC3339).
    pub timestamp: DateTime<Utc>,
}

impl WorkflowResponse {
    /// Builds a request-level failure response carrying no execution.
    pub fn request_failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            execution_id: String::new(),
            status: "failed".to_string(),
            success: false,
            results: HashMap::new(),
            error: Some(error.into()),
            duration: "0s".to_string(),
            task_results: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Request to a downstream worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Correlation ID echoed in the service response.
    pub correlation_id: String,

    /// Operation the service should perform.
    pub operation: String,

    /// Rendered task parameters.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    /// Per-call timeout hint in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Response from a downstream worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// Correlation ID echoed from the request.
    pub correlation_id: String,

    /// Whether the operation succeeded.
    pub success: bool,

    /// Operation output; forwarded opaquely into the task output map.
    #[serde(default)]
    pub data: HashMap<String, Value>,

    /// Error string when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceResponse {
    /// Builds a successful response.
    pub fn ok(correlation_id: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: true,
            data,
            error: None,
        }
    }

    /// Builds a failure response.
    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: false,
            data: HashMap::new(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let raw = r#"{"correlation_id":"c1","workflow_template":"t1","variables":{}}"#;
        let request: WorkflowRequest = serde_json::from_str(raw).unwrap();

        assert_eq!(request.operation, Operation::ExecuteWorkflow);
        assert_eq!(request.workflow_template.as_deref(), Some("t1"));
        assert_eq!(request.priority, 0);
        assert!(!request.force);
    }

    #[test]
    fn test_operation_wire_names() {
        let op: Operation = serde_json::from_str("\"cancel_workflow\"").unwrap();
        assert_eq!(op, Operation::CancelWorkflow);
        assert_eq!(op.as_str(), "cancel_workflow");
    }

    #[test]
    fn test_response_roundtrip() {
        let response = WorkflowResponse::request_failure("c1", "unknown template");
        let raw = serde_json::to_string(&response).unwrap();
        let decoded: WorkflowResponse = serde_json::from_str(&raw).unwrap();

        assert_eq!(decoded.correlation_id, "c1");
        assert!(!decoded.success);
        assert_eq!(decoded.error.as_deref(), Some("unknown template"));
    }

    #[test]
    fn test_service_response_defaults() {
        let raw = r#"{"correlation_id":"c1-a","success":true}"#;
        let response: ServiceResponse = serde_json::from_str(raw).unwrap();
        assert!(response.data.is_empty());
        assert!(response.error.is_none());
    }
}

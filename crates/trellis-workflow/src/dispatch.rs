//! Task dispatcher: routes typed tasks to backend services.

use crate::definition::{TaskDef, TaskType};
use crate::error::{WorkflowError, WorkflowResult};
use crate::params;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use trellis_bus::{
    BusError, CorrelationTable, ServiceRequest, ServiceRoute, AI_ROUTE, DATA_ROUTE, EXEC_ROUTE,
};

/// Default per-service call timeouts.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTimeouts {
    /// Data/graph service default.
    pub data: Duration,

    /// AI service default.
    pub ai: Duration,

    /// Execution/sandbox service default.
    pub exec: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            data: Duration::from_secs(60),
            ai: Duration::from_secs(120),
            exec: Duration::from_secs(300),
        }
    }
}

/// Translates a task in the context of a live execution into a correlated
/// backend call.
pub struct TaskDispatcher {
    correlation: Arc<CorrelationTable>,
    timeouts: ServiceTimeouts,
}

impl TaskDispatcher {
    /// Creates a dispatcher over the correlation layer.
    pub fn new(correlation: Arc<CorrelationTable>, timeouts: ServiceTimeouts) -> Self {
        Self {
            correlation,
            timeouts,
        }
    }

    fn route_for(&self, task_type: TaskType) -> Option<(ServiceRoute, Duration)> {
        match task_type {
            TaskType::Data => Some((DATA_ROUTE, self.timeouts.data)),
            TaskType::Ai => Some((AI_ROUTE, self.timeouts.ai)),
            TaskType::Exec => Some((EXEC_ROUTE, self.timeouts.exec)),
            TaskType::Parallel | TaskType::Condition => None,
        }
    }

    /// Derives the subcall correlation ID for one dispatch attempt.
    ///
    /// The execution's correlation ID prefixes the task ID; retries append
    /// the attempt so a late first-attempt response can never satisfy a
    /// later attempt's awaiter.
    fn subcall_correlation_id(execution_correlation_id: &str, task_id: &str, attempt: u32) -> String {
        if attempt == 0 {
            format!("{}-{}", execution_correlation_id, task_id)
        } else {
            format!("{}-{}-r{}", execution_correlation_id, task_id, attempt)
        }
    }

    /// Renders the task's parameters and issues one backend call.
    ///
    /// Returns the response's `data` map on success. Parameter errors fail
    /// before anything is published.
    pub async fn dispatch(
        &self,
        task: &TaskDef,
        variables: &HashMap<String, Value>,
        execution_correlation_id: &str,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> WorkflowResult<HashMap<String, Value>> {
        let (route, default_timeout) = self.route_for(task.task_type).ok_or_else(|| {
            WorkflowError::Internal(format!(
                "Task '{}' of type '{}' does not dispatch to a backend",
                task.id, task.task_type
            ))
        })?;

        let parameters = params::render(&task.id, &task.parameters, variables)?;
        let operation = parameters
            .get("operation")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| WorkflowError::Parameter {
                task_id: task.id.clone(),
                reason: "missing 'operation' parameter".to_string(),
            })?;

        let timeout = task
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);

        let request = ServiceRequest {
            correlation_id: Self::subcall_correlation_id(
                execution_correlation_id,
                &task.id,
                attempt,
            ),
            operation,
            parameters,
            timeout_secs: Some(timeout.as_secs()),
        };

        debug!(
            "Dispatching task '{}' ({}) to '{}' as {}",
            task.id, task.task_type, route.request, request.correlation_id
        );

        let response = self
            .correlation
            .call(route, request, timeout, cancel)
            .await
            .map_err(|err| match err {
                BusError::Timeout { .. } => WorkflowError::TaskTimeout {
                    task_id: task.id.clone(),
                    timeout_secs: timeout.as_secs(),
                },
                BusError::Cancelled(_) => WorkflowError::Cancelled(task.id.clone()),
                other => WorkflowError::Backend {
                    task_id: task.id.clone(),
                    reason: other.to_string(),
                },
            })?;

        if !response.success {
            return Err(WorkflowError::Backend {
                task_id: task.id.clone(),
                reason: response
                    .error
                    .unwrap_or_else(|| "backend reported failure".to_string()),
            });
        }

        Ok(response.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_bus::{BusAdapter, InMemoryBus, ServiceResponse};

    async fn dispatcher_with_data_service(
        respond: impl Fn(&ServiceRequest) -> ServiceResponse + Send + Sync + 'static,
    ) -> TaskDispatcher {
        let bus = Arc::new(InMemoryBus::new());
        let correlation = Arc::new(CorrelationTable::new(bus.clone()));
        correlation
            .start_response_pump(DATA_ROUTE.response)
            .await
            .unwrap();

        let mut requests = bus.subscribe(DATA_ROUTE.request).await.unwrap();
        let service_bus = bus.clone();
        tokio::spawn(async move {
            while let Some(payload) = requests.next().await {
                let request: ServiceRequest = serde_json::from_slice(&payload).unwrap();
                let response = respond(&request);
                service_bus
                    .publish(DATA_ROUTE.response, serde_json::to_vec(&response).unwrap())
                    .await
                    .unwrap();
            }
        });

        TaskDispatcher::new(correlation, ServiceTimeouts::default())
    }

    fn task() -> TaskDef {
        TaskDef::new("a", TaskType::Data)
            .with_parameter("operation", json!("traverse"))
            .with_parameter("cypher", json!("MATCH (n:${label}) RETURN n"))
    }

    fn variables() -> HashMap<String, Value> {
        let mut variables = HashMap::new();
        variables.insert("label".to_string(), json!("Person"));
        variables
    }

    #[tokio::test]
    async fn test_dispatch_renders_and_calls() {
        let dispatcher = dispatcher_with_data_service(|request| {
            assert_eq!(request.operation, "traverse");
            assert_eq!(
                request.parameters["cypher"],
                json!("MATCH (n:Person) RETURN n")
            );
            let mut data = HashMap::new();
            data.insert("nodes".to_string(), json!([{"id": "n1"}]));
            ServiceResponse::ok(request.correlation_id.clone(), data)
        })
        .await;

        let output = dispatcher
            .dispatch(&task(), &variables(), "c1", 0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output["nodes"], json!([{"id": "n1"}]));
    }

    #[tokio::test]
    async fn test_backend_failure_maps_to_error() {
        let dispatcher = dispatcher_with_data_service(|request| {
            ServiceResponse::failure(request.correlation_id.clone(), "graph unavailable")
        })
        .await;

        let result = dispatcher
            .dispatch(&task(), &variables(), "c1", 0, &CancellationToken::new())
            .await;

        match result {
            Err(WorkflowError::Backend { task_id, reason }) => {
                assert_eq!(task_id, "a");
                assert_eq!(reason, "graph unavailable");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolved_parameter_fails_without_dispatch() {
        let bus = Arc::new(InMemoryBus::new());
        let correlation = Arc::new(CorrelationTable::new(bus));
        let dispatcher = TaskDispatcher::new(correlation.clone(), ServiceTimeouts::default());

        let result = dispatcher
            .dispatch(
                &task(),
                &HashMap::new(),
                "c1",
                0,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(WorkflowError::Parameter { .. })));
        assert_eq!(correlation.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_operation_parameter_fails() {
        let bus = Arc::new(InMemoryBus::new());
        let correlation = Arc::new(CorrelationTable::new(bus));
        let dispatcher = TaskDispatcher::new(correlation, ServiceTimeouts::default());

        let task = TaskDef::new("a", TaskType::Data).with_parameter("cypher", json!("RETURN 1"));
        let result = dispatcher
            .dispatch(
                &task,
                &HashMap::new(),
                "c1",
                0,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(WorkflowError::Parameter { .. })));
    }

    #[test]
    fn test_subcall_correlation_ids() {
        assert_eq!(TaskDispatcher::subcall_correlation_id("c1", "a", 0), "c1-a");
        assert_eq!(
            TaskDispatcher::subcall_correlation_id("c1", "a", 2),
            "c1-a-r2"
        );
    }

    #[tokio::test]
    async fn test_internal_task_types_do_not_dispatch() {
        let bus = Arc::new(InMemoryBus::new());
        let correlation = Arc::new(CorrelationTable::new(bus));
        let dispatcher = TaskDispatcher::new(correlation, ServiceTimeouts::default());

        let task = TaskDef::new("branch", TaskType::Condition).with_condition("${x} == 1");
        let result = dispatcher
            .dispatch(
                &task,
                &HashMap::new(),
                "c1",
                0,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(WorkflowError::Internal(_))));
    }
}

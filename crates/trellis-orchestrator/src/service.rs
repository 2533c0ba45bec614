//! The orchestrator service: consumes workflow requests from the bus,
//! drives executions, and reports results.

use crate::capabilities;
use crate::config::OrchestratorConfig;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trellis_bus::{
    BusAdapter, BusResult, CorrelationTable, Operation, ServiceRequest, TaskResultSummary,
    WorkflowRequest, WorkflowResponse, AI_ROUTE, SERVICE_ROUTES, WORKFLOW_REQUESTS,
    WORKFLOW_RESPONSES,
};
use trellis_workflow::{
    DagExecutor, ExecutionRegistry, TaskDispatcher, TemplateStore, WorkflowDefinition,
    WorkflowError, WorkflowExecution, WorkflowResult,
};

/// The orchestrator process core.
///
/// One instance owns the registry, correlation table and template store;
/// everything is constructed at startup and passed explicitly.
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: Arc<dyn BusAdapter>,
    correlation: Arc<CorrelationTable>,
    registry: Arc<ExecutionRegistry>,
    templates: Arc<TemplateStore>,
    executor: Arc<DagExecutor>,
}

impl Orchestrator {
    /// Builds the orchestrator over a bus adapter.
    ///
    /// Fails when the template directory cannot be read.
    pub fn new(config: OrchestratorConfig, bus: Arc<dyn BusAdapter>) -> WorkflowResult<Self> {
        let templates = Arc::new(TemplateStore::open(&config.templates_dir)?);
        let correlation = Arc::new(CorrelationTable::new(bus.clone()));
        let registry = Arc::new(ExecutionRegistry::new(config.registry_config()));
        let dispatcher = Arc::new(TaskDispatcher::new(
            correlation.clone(),
            config.service_timeouts(),
        ));
        let executor = Arc::new(DagExecutor::new(
            registry.clone(),
            dispatcher,
            config.executor_config(),
        ));

        Ok(Self {
            config,
            bus,
            correlation,
            registry,
            templates,
            executor,
        })
    }

    /// The execution registry.
    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// The correlation table.
    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.correlation
    }

    /// The template store.
    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    /// Runs the request loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> BusResult<()> {
        for route in SERVICE_ROUTES {
            self.correlation.start_response_pump(route.response).await?;
        }
        self.registry.spawn_cleanup(shutdown.clone());
        capabilities::spawn_announcer(
            self.bus.clone(),
            Duration::from_secs(self.config.capability_refresh_interval_secs),
            shutdown.clone(),
        );

        let mut requests = self.bus.subscribe(WORKFLOW_REQUESTS).await?;
        info!("Orchestrator listening on '{}'", WORKFLOW_REQUESTS);

        loop {
            tokio::select! {
                payload = requests.next() => {
                    match payload {
                        Some(payload) => {
                            let orchestrator = Arc::clone(&self);
                            tokio::spawn(async move {
                                orchestrator.handle_payload(payload).await;
                            });
                        }
                        None => {
                            warn!("Request channel closed, stopping");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signalled, stopping request loop");
                    self.cancel_live_executions().await;
                    return Ok(());
                }
            }
        }
    }

    /// Signals cancellation to every live execution on shutdown; the
    /// drivers still publish their terminal responses.
    async fn cancel_live_executions(&self) {
        for execution_id in self.registry.execution_ids() {
            match self.registry.cancel(&execution_id, "orchestrator shutting down").await {
                Ok(()) => info!("Cancelled execution {} for shutdown", execution_id),
                Err(WorkflowError::AlreadyTerminal(_)) | Err(WorkflowError::NotFound(_)) => {}
                Err(err) => warn!("Shutdown cancel of {} failed: {}", execution_id, err),
            }
        }
    }

    /// Decodes and routes one inbound payload.
    async fn handle_payload(self: Arc<Self>, payload: Vec<u8>) {
        let request: WorkflowRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                // Answer malformed payloads when a correlation id is
                // recoverable; drop them otherwise.
                warn!("Malformed workflow request: {}", err);
                if let Some(correlation_id) = serde_json::from_slice::<Value>(&payload)
                    .ok()
                    .as_ref()
                    .and_then(|value| value.get("correlation_id"))
                    .and_then(Value::as_str)
                {
                    self.publish_response(WorkflowResponse::request_failure(
                        correlation_id,
                        format!("malformed request: {}", err),
                    ))
                    .await;
                }
                return;
            }
        };

        debug!(
            "Handling {} request {}",
            request.operation.as_str(),
            request.correlation_id
        );

        let response = match request.operation {
            Operation::ExecuteWorkflow | Operation::GenerateAiWorkflow => {
                Arc::clone(&self).start_execution(request).await
            }
            Operation::GetExecutionStatus => Some(self.execution_status(request).await),
            Operation::CancelWorkflow => Some(self.cancel_workflow(request).await),
            Operation::ListTemplates => Some(self.list_templates(request)),
        };

        if let Some(response) = response {
            self.publish_response(response).await;
        }
    }

    /// Renders, admits and launches an execution.
    ///
    /// Returns an immediate failure response for request-level errors;
    /// otherwise the spawned driver publishes the single terminal
    /// response.
    async fn start_execution(self: Arc<Self>, request: WorkflowRequest) -> Option<WorkflowResponse> {
        let definition = match self.resolve_definition(&request).await {
            Ok(definition) => definition,
            Err(err) => {
                return Some(WorkflowResponse::request_failure(
                    &request.correlation_id,
                    err.to_string(),
                ));
            }
        };

        if let Err(err) = definition.validate() {
            return Some(WorkflowResponse::request_failure(
                &request.correlation_id,
                err.to_string(),
            ));
        }

        let handle = match self.registry.admit(
            &definition.id,
            &request.correlation_id,
            definition.variables.clone(),
        ) {
            Ok(handle) => handle,
            Err(err @ WorkflowError::RegistryBusy { .. }) => {
                let mut response = WorkflowResponse::request_failure(
                    &request.correlation_id,
                    format!("orchestrator at capacity: {}", err),
                );
                response
                    .results
                    .insert("retry_after_secs".to_string(), json!(5));
                return Some(response);
            }
            Err(err) => {
                return Some(WorkflowResponse::request_failure(
                    &request.correlation_id,
                    err.to_string(),
                ));
            }
        };

        let priority = request.priority;
        handle
            .update(move |execution| {
                execution
                    .metadata
                    .insert("priority".to_string(), priority.to_string());
            })
            .await;

        let orchestrator = Arc::clone(&self);
        tokio::spawn(async move {
            let execution_id = handle.id().to_string();
            if let Err(err) = orchestrator.executor.run(definition, handle.clone()).await {
                error!("Driver for execution {} failed: {}", execution_id, err);
                if !handle.is_terminal() {
                    let message = err.to_string();
                    let _ = orchestrator
                        .registry
                        .update_status(
                            &execution_id,
                            trellis_workflow::ExecutionStatus::Failed,
                            move |execution| execution.error = Some(message),
                        )
                        .await;
                }
            }

            let snapshot = handle.snapshot().await;
            orchestrator
                .publish_response(response_from_execution(&snapshot))
                .await;
        });

        None
    }

    /// Resolves the workflow definition for an execution request.
    async fn resolve_definition(&self, request: &WorkflowRequest) -> WorkflowResult<WorkflowDefinition> {
        if let Some(template_id) = &request.workflow_template {
            return self.templates.render(template_id, &request.variables);
        }

        if let Some(brief) = &request.generate_from_ai {
            let mut definition = self.generate_definition(request, brief).await?;
            for (name, value) in &request.variables {
                definition.variables.insert(name.clone(), value.clone());
            }
            return Ok(definition);
        }

        Err(WorkflowError::Request(
            "workflow_template is required unless generate_from_ai is set".to_string(),
        ))
    }

    /// Asks the AI service for a workflow definition.
    ///
    /// The generated definition passes the same validation as on-disk
    /// templates before anything executes.
    async fn generate_definition(
        &self,
        request: &WorkflowRequest,
        brief: &Value,
    ) -> WorkflowResult<WorkflowDefinition> {
        let mut parameters = HashMap::new();
        parameters.insert("spec".to_string(), brief.clone());

        let timeout = Duration::from_secs(self.config.ai_timeout_secs);
        let service_request = ServiceRequest {
            correlation_id: format!("{}-generate", request.correlation_id),
            operation: "generate_workflow".to_string(),
            parameters,
            timeout_secs: Some(timeout.as_secs()),
        };

        let response = self
            .correlation
            .call(AI_ROUTE, service_request, timeout, &CancellationToken::new())
            .await
            .map_err(|err| {
                WorkflowError::Request(format!("workflow generation failed: {}", err))
            })?;

        if !response.success {
            return Err(WorkflowError::Request(format!(
                "workflow generation failed: {}",
                response.error.unwrap_or_else(|| "no error given".to_string())
            )));
        }

        let document = response.data.get("workflow").ok_or_else(|| {
            WorkflowError::Request("generator returned no workflow".to_string())
        })?;
        let definition: WorkflowDefinition = serde_json::from_value(document.clone())
            .map_err(|err| WorkflowError::Request(format!("generated workflow is invalid: {}", err)))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Builds the status payload for a query; side-effect free.
    async fn execution_status(&self, request: WorkflowRequest) -> WorkflowResponse {
        let Some(execution_id) = request.execution_id.as_deref() else {
            return WorkflowResponse::request_failure(
                &request.correlation_id,
                "execution_id is required",
            );
        };

        match self.registry.get(execution_id) {
            Ok(handle) => {
                let snapshot = handle.snapshot().await;
                let mut response = response_from_execution(&snapshot);
                response.correlation_id = request.correlation_id;
                response.results.insert(
                    "progress".to_string(),
                    json!(snapshot.completion_percentage()),
                );
                let counts: HashMap<String, usize> = snapshot
                    .task_status_counts()
                    .into_iter()
                    .map(|(status, count)| (status.to_string(), count))
                    .collect();
                response
                    .results
                    .insert("task_counts".to_string(), json!(counts));
                response
            }
            Err(err) => {
                WorkflowResponse::request_failure(&request.correlation_id, err.to_string())
            }
        }
    }

    /// Requests cancellation of a live execution.
    async fn cancel_workflow(&self, request: WorkflowRequest) -> WorkflowResponse {
        let Some(execution_id) = request.execution_id.clone() else {
            return WorkflowResponse::request_failure(
                &request.correlation_id,
                "execution_id is required",
            );
        };

        let reason = if request.force {
            "cancelled by caller (force)"
        } else {
            "cancelled by caller"
        };

        match self.registry.cancel(&execution_id, reason).await {
            Ok(()) => {
                let mut results = HashMap::new();
                results.insert("cancel_requested".to_string(), json!(true));
                WorkflowResponse {
                    correlation_id: request.correlation_id,
                    execution_id,
                    status: "running".to_string(),
                    success: true,
                    results,
                    error: None,
                    duration: "0s".to_string(),
                    task_results: HashMap::new(),
                    timestamp: Utc::now(),
                }
            }
            Err(err) => {
                WorkflowResponse::request_failure(&request.correlation_id, err.to_string())
            }
        }
    }

    /// Lists the available templates.
    fn list_templates(&self, request: WorkflowRequest) -> WorkflowResponse {
        let templates: Vec<Value> = self
            .templates
            .list()
            .into_iter()
            .map(|template| {
                json!({
                    "id": template.id,
                    "name": template.name,
                    "description": template.description,
                    "category": template.category,
                    "version": template.version,
                    "variables": template
                        .variables
                        .iter()
                        .map(|variable| variable.name.clone())
                        .collect::<Vec<String>>(),
                })
            })
            .collect();

        let mut results = HashMap::new();
        results.insert("templates".to_string(), json!(templates));

        WorkflowResponse {
            correlation_id: request.correlation_id,
            execution_id: String::new(),
            status: "completed".to_string(),
            success: true,
            results,
            error: None,
            duration: "0s".to_string(),
            task_results: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Publishes one response on the response channel.
    async fn publish_response(&self, response: WorkflowResponse) {
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Response encoding failed: {}", err);
                return;
            }
        };
        if let Err(err) = self.bus.publish(WORKFLOW_RESPONSES, payload).await {
            error!(
                "Publishing response for {} failed: {}",
                response.correlation_id, err
            );
        }
    }
}

/// Maps an execution snapshot onto the wire response.
fn response_from_execution(execution: &WorkflowExecution) -> WorkflowResponse {
    let task_results: HashMap<String, TaskResultSummary> = execution
        .tasks
        .iter()
        .map(|(task_id, record)| {
            (
                task_id.clone(),
                TaskResultSummary {
                    status: record.status.to_string(),
                    output: record.output.clone(),
                    error: record.error.clone(),
                    retry_count: record.retry_count,
                },
            )
        })
        .collect();

    WorkflowResponse {
        correlation_id: execution.correlation_id.clone(),
        execution_id: execution.execution_id.clone(),
        status: execution.status.to_string(),
        success: execution.status == trellis_workflow::ExecutionStatus::Completed,
        results: execution.variables.clone(),
        error: execution.error.clone(),
        duration: humantime::format_duration(Duration::from_millis(execution.duration_ms()))
            .to_string(),
        task_results,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trellis_bus::{BusSubscription, InMemoryBus, ServiceResponse, ServiceRoute, DATA_ROUTE};

    const SUMMARY_TEMPLATE: &str = r#"
id: t1
name: Graph summary
category: analysis
variables:
  - name: limit
    type: int
    default: 1
workflow:
  id: graph-summary
  tasks:
    - id: a
      type: data
      parameters:
        operation: traverse
        cypher: "MATCH (n) RETURN n LIMIT ${limit}"
    - id: b
      type: ai
      depends_on: [a]
      parameters:
        operation: summarize
        text: "${tasks.a.nodes}"
"#;

    const STUCK_TEMPLATE: &str = r#"
id: stuck
name: Long-running job
workflow:
  id: long-job
  tasks:
    - id: job
      type: exec
      parameters:
        operation: run
        command: "sleep forever"
"#;

    struct TestBed {
        bus: Arc<InMemoryBus>,
        orchestrator: Arc<Orchestrator>,
        responses: BusSubscription,
        shutdown: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Drop for TestBed {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn testbed(max_concurrent: usize) -> TestBed {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t1.yaml"), SUMMARY_TEMPLATE).unwrap();
        std::fs::write(dir.path().join("stuck.yaml"), STUCK_TEMPLATE).unwrap();

        let mut config = OrchestratorConfig::default();
        config.templates_dir = dir.path().into();
        config.max_concurrent_workflows = max_concurrent;
        config.shutdown_timeout_secs = 1;
        config.capability_refresh_interval_secs = 3600;

        let bus = Arc::new(InMemoryBus::new());
        let responses = bus.subscribe(WORKFLOW_RESPONSES).await.unwrap();
        let orchestrator = Arc::new(Orchestrator::new(config, bus.clone()).unwrap());

        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&orchestrator).run(shutdown.clone()));
        while bus.subscriber_count(WORKFLOW_REQUESTS) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        TestBed {
            bus,
            orchestrator,
            responses,
            shutdown,
            _dir: dir,
        }
    }

    async fn spawn_scripted_service(
        bus: Arc<InMemoryBus>,
        route: ServiceRoute,
        script: impl Fn(&ServiceRequest, usize) -> Option<ServiceResponse> + Send + Sync + 'static,
    ) {
        let calls = AtomicUsize::new(0);
        let mut requests = bus.subscribe(route.request).await.unwrap();
        tokio::spawn(async move {
            while let Some(payload) = requests.next().await {
                let request: ServiceRequest = serde_json::from_slice(&payload).unwrap();
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if let Some(response) = script(&request, call) {
                    bus.publish(route.response, serde_json::to_vec(&response).unwrap())
                        .await
                        .unwrap();
                }
            }
        });
    }

    async fn send(bed: &TestBed, request: &WorkflowRequest) {
        bed.bus
            .publish(WORKFLOW_REQUESTS, serde_json::to_vec(request).unwrap())
            .await
            .unwrap();
    }

    async fn next_response(bed: &mut TestBed) -> WorkflowResponse {
        let payload = tokio::time::timeout(Duration::from_secs(3), bed.responses.next())
            .await
            .expect("timed out waiting for a response")
            .expect("response channel closed");
        serde_json::from_slice(&payload).unwrap()
    }

    fn data_service_nodes() -> impl Fn(&ServiceRequest, usize) -> Option<ServiceResponse> {
        |request, _| {
            let mut data = HashMap::new();
            data.insert("nodes".to_string(), json!([{"id": "n1"}]));
            Some(ServiceResponse::ok(request.correlation_id.clone(), data))
        }
    }

    fn ai_service_summary() -> impl Fn(&ServiceRequest, usize) -> Option<ServiceResponse> {
        |request, _| {
            assert_eq!(request.operation, "summarize");
            let mut data = HashMap::new();
            data.insert("summary".to_string(), json!("one node"));
            Some(ServiceResponse::ok(request.correlation_id.clone(), data))
        }
    }

    #[tokio::test]
    async fn test_linear_workflow_end_to_end() {
        let mut bed = testbed(10).await;
        spawn_scripted_service(bed.bus.clone(), DATA_ROUTE, data_service_nodes()).await;
        spawn_scripted_service(bed.bus.clone(), AI_ROUTE, ai_service_summary()).await;

        send(&bed, &WorkflowRequest::execute("c1", "t1")).await;
        let response = next_response(&mut bed).await;

        assert_eq!(response.correlation_id, "c1");
        assert!(response.success);
        assert_eq!(response.status, "completed");
        assert_eq!(response.task_results["a"].status, "completed");
        assert_eq!(response.task_results["b"].output["summary"], json!("one node"));
        assert!(!response.duration.is_empty());
        assert!(!response.execution_id.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_template_is_request_error() {
        let mut bed = testbed(10).await;

        send(&bed, &WorkflowRequest::execute("c1", "ghost")).await;
        let response = next_response(&mut bed).await;

        assert_eq!(response.correlation_id, "c1");
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("Template not found"));
        // No execution record persists for rejected requests.
        assert_eq!(bed.orchestrator.registry().len(), 0);
    }

    #[tokio::test]
    async fn test_admission_rejection_when_at_capacity() {
        let mut bed = testbed(1).await;

        // The exec service never answers, so the first execution stays live.
        send(&bed, &WorkflowRequest::execute("c1", "stuck")).await;
        while bed.orchestrator.registry().live_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        send(&bed, &WorkflowRequest::execute("c2", "stuck")).await;
        let response = next_response(&mut bed).await;

        assert_eq!(response.correlation_id, "c2");
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("capacity"));
        assert_eq!(response.results["retry_after_secs"], json!(5));
    }

    #[tokio::test]
    async fn test_cancel_workflow_mid_flight() {
        let mut bed = testbed(10).await;

        send(&bed, &WorkflowRequest::execute("c1", "stuck")).await;
        while bed.orchestrator.registry().live_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let execution_id = bed.orchestrator.registry().execution_ids().remove(0);

        let mut cancel = WorkflowRequest::execute("c2", "stuck");
        cancel.operation = Operation::CancelWorkflow;
        cancel.workflow_template = None;
        cancel.execution_id = Some(execution_id.clone());
        send(&bed, &cancel).await;

        let mut ack = None;
        let mut terminal = None;
        for _ in 0..2 {
            let response = next_response(&mut bed).await;
            match response.correlation_id.as_str() {
                "c2" => ack = Some(response),
                "c1" => terminal = Some(response),
                other => panic!("unexpected correlation id {}", other),
            }
        }

        let ack = ack.expect("no cancel acknowledgement");
        assert!(ack.success);
        assert_eq!(ack.results["cancel_requested"], json!(true));

        let terminal = terminal.expect("no terminal response");
        assert_eq!(terminal.status, "cancelled");
        assert!(!terminal.success);
        assert_eq!(terminal.task_results["job"].status, "cancelled");

        // Exactly one terminal response: nothing else arrives for c1.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), bed.responses.next())
                .await
                .is_err()
        );
        assert_eq!(bed.orchestrator.correlation().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_execution_status_is_side_effect_free() {
        let mut bed = testbed(10).await;
        spawn_scripted_service(bed.bus.clone(), DATA_ROUTE, data_service_nodes()).await;
        spawn_scripted_service(bed.bus.clone(), AI_ROUTE, ai_service_summary()).await;

        send(&bed, &WorkflowRequest::execute("c1", "t1")).await;
        let terminal = next_response(&mut bed).await;

        let mut status = WorkflowRequest::execute("c2", "t1");
        status.operation = Operation::GetExecutionStatus;
        status.workflow_template = None;
        status.execution_id = Some(terminal.execution_id.clone());

        send(&bed, &status).await;
        let first = next_response(&mut bed).await;
        status.correlation_id = "c3".to_string();
        send(&bed, &status).await;
        let second = next_response(&mut bed).await;

        assert_eq!(first.status, "completed");
        assert_eq!(first.results["progress"], json!(100.0));
        assert_eq!(first.status, second.status);
        assert_eq!(first.task_results["b"].output, second.task_results["b"].output);
    }

    #[tokio::test]
    async fn test_status_for_unknown_execution_fails() {
        let mut bed = testbed(10).await;

        let mut status = WorkflowRequest::execute("c1", "t1");
        status.operation = Operation::GetExecutionStatus;
        status.workflow_template = None;
        status.execution_id = Some("exec-999999".to_string());

        send(&bed, &status).await;
        let response = next_response(&mut bed).await;

        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_list_templates() {
        let mut bed = testbed(10).await;

        let mut list = WorkflowRequest::execute("c1", "t1");
        list.operation = Operation::ListTemplates;
        list.workflow_template = None;

        send(&bed, &list).await;
        let response = next_response(&mut bed).await;

        assert!(response.success);
        let templates = response.results["templates"].as_array().unwrap();
        assert_eq!(templates.len(), 2);
        assert!(templates.iter().any(|t| t["id"] == json!("t1")));
        assert!(templates.iter().any(|t| t["id"] == json!("stuck")));
    }

    #[tokio::test]
    async fn test_malformed_request_with_correlation_id_is_answered() {
        let mut bed = testbed(10).await;

        bed.bus
            .publish(
                WORKFLOW_REQUESTS,
                br#"{"correlation_id": "cx", "operation": 42}"#.to_vec(),
            )
            .await
            .unwrap();

        let response = next_response(&mut bed).await;
        assert_eq!(response.correlation_id, "cx");
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_generated_workflow_is_validated_and_executed() {
        let mut bed = testbed(10).await;
        spawn_scripted_service(bed.bus.clone(), DATA_ROUTE, data_service_nodes()).await;
        spawn_scripted_service(bed.bus.clone(), AI_ROUTE, |request, _| {
            let mut data = HashMap::new();
            if request.operation == "generate_workflow" {
                data.insert(
                    "workflow".to_string(),
                    json!({
                        "id": "generated",
                        "tasks": [{
                            "id": "fetch",
                            "type": "data",
                            "parameters": {"operation": "search", "query": "everything"}
                        }]
                    }),
                );
            }
            Some(ServiceResponse::ok(request.correlation_id.clone(), data))
        })
        .await;

        let request = WorkflowRequest {
            correlation_id: "c1".to_string(),
            operation: Operation::GenerateAiWorkflow,
            workflow_template: None,
            variables: HashMap::new(),
            generate_from_ai: Some(json!({"goal": "fetch the graph"})),
            priority: 0,
            execution_id: None,
            force: false,
        };
        send(&bed, &request).await;

        let response = next_response(&mut bed).await;
        assert!(response.success);
        assert_eq!(response.status, "completed");
        assert_eq!(response.task_results["fetch"].status, "completed");
    }

    #[tokio::test]
    async fn test_generated_cyclic_workflow_is_rejected() {
        let mut bed = testbed(10).await;
        spawn_scripted_service(bed.bus.clone(), AI_ROUTE, |request, _| {
            let mut data = HashMap::new();
            data.insert(
                "workflow".to_string(),
                json!({
                    "id": "cyclic",
                    "tasks": [
                        {"id": "a", "type": "data", "depends_on": ["b"],
                         "parameters": {"operation": "search"}},
                        {"id": "b", "type": "data", "depends_on": ["a"],
                         "parameters": {"operation": "search"}}
                    ]
                }),
            );
            Some(ServiceResponse::ok(request.correlation_id.clone(), data))
        })
        .await;

        let request = WorkflowRequest {
            correlation_id: "c1".to_string(),
            operation: Operation::GenerateAiWorkflow,
            workflow_template: None,
            variables: HashMap::new(),
            generate_from_ai: Some(json!({"goal": "loop forever"})),
            priority: 0,
            execution_id: None,
            force: false,
        };
        send(&bed, &request).await;

        let response = next_response(&mut bed).await;
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("Cycle"));
        assert_eq!(bed.orchestrator.registry().len(), 0);
    }
}

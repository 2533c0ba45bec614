//! Workflow definitions: typed tasks wired into a dependency DAG.

use crate::error::{WorkflowError, WorkflowResult};
use daggy::{Dag, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Backend category a task dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Data/graph service call.
    Data,

    /// AI service call.
    Ai,

    /// Execution/sandbox service call.
    Exec,

    /// Executor-internal aggregator over child tasks.
    Parallel,

    /// Executor-internal branch point.
    Condition,
}

impl TaskType {
    /// Wire name of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Data => "data",
            TaskType::Ai => "ai",
            TaskType::Exec => "exec",
            TaskType::Parallel => "parallel",
            TaskType::Condition => "condition",
        }
    }

    /// Returns true if the type dispatches to a backend service.
    pub fn is_backend(&self) -> bool {
        matches!(self, TaskType::Data | TaskType::Ai | TaskType::Exec)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff shape between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay for every retry.
    Fixed,

    /// Delay grows linearly with the attempt number.
    Linear,

    /// Delay doubles per attempt, capped by the max delay.
    Exponential,
}

impl Default for BackoffKind {
    fn default() -> Self {
        BackoffKind::Fixed
    }
}

/// Retry policy for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Backoff shape.
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Cap on the computed delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,

    /// Add random jitter (up to 50% of the delay) to spread retries.
    #[serde(default)]
    pub jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

impl RetryPolicy {
    /// Creates a fixed-delay retry policy.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: BackoffKind::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: None,
            jitter: false,
        }
    }

    /// Creates a linear backoff retry policy.
    pub fn linear(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: BackoffKind::Linear,
            initial_delay_ms,
            max_delay_ms: None,
            jitter: false,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: BackoffKind::Exponential,
            initial_delay_ms,
            max_delay_ms: Some(max_delay_ms),
            jitter: false,
        }
    }

    /// Enables jitter on the computed delays.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry `attempt` (1-based); None once retries are
    /// exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }

        let base = match self.backoff {
            BackoffKind::Fixed => self.initial_delay_ms,
            BackoffKind::Linear => self.initial_delay_ms.saturating_mul(attempt as u64),
            BackoffKind::Exponential => {
                let doubled = self
                    .initial_delay_ms
                    .saturating_mul(1u64 << (attempt - 1).min(32));
                match self.max_delay_ms {
                    Some(cap) => doubled.min(cap),
                    None => doubled,
                }
            }
        };

        let mut delay = base;
        if self.jitter {
            let jitter_range = delay / 2;
            if jitter_range > 0 {
                delay = delay.saturating_add(rand::random::<u64>() % (jitter_range + 1));
            }
        }
        if let Some(cap) = self.max_delay_ms {
            delay = delay.min(cap);
        }

        Some(Duration::from_millis(delay))
    }
}

/// Global strategy applied when a task fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Fail the execution, cancel running tasks, skip pending ones.
    Abort,

    /// Keep the execution going where the graph permits.
    Continue,

    /// Reset the failed task to pending while the global budget lasts.
    Retry,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        ErrorStrategy::Abort
    }
}

/// Workflow-level error handling declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandling {
    /// Strategy on terminal task failure.
    #[serde(default)]
    pub strategy: ErrorStrategy,

    /// Global retry budget for the `retry` strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Opaque notification target forwarded to operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
}

/// A single typed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    /// Unique task identifier within the workflow.
    pub id: String,

    /// Human-readable task name.
    #[serde(default)]
    pub name: String,

    /// Backend type.
    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Predecessor task IDs.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Parameter mapping; string leaves may contain `${path}` substitutions.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    /// Retry policy consulted on dispatch failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Timeout bounding one dispatch attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Boolean guard evaluated against the variable scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Tasks enabled on success (or a true condition).
    #[serde(default)]
    pub on_success: Vec<String>,

    /// Tasks enabled on failure (or a false condition).
    #[serde(default)]
    pub on_failure: Vec<String>,

    /// Aliases copying output keys into top-level variables.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl TaskDef {
    /// Creates a new task with the given ID and type.
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            task_type,
            depends_on: Vec::new(),
            parameters: HashMap::new(),
            retry: None,
            timeout_secs: None,
            condition: None,
            on_success: Vec::new(),
            on_failure: Vec::new(),
            variables: HashMap::new(),
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a dependency on another task.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    /// Sets a parameter value.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Sets the boolean guard expression.
    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    /// Adds an output alias.
    pub fn with_alias(mut self, variable: impl Into<String>, output_key: impl Into<String>) -> Self {
        self.variables.insert(variable.into(), output_key.into());
        self
    }

    /// Child task IDs declared by a `parallel` task.
    pub fn child_task_ids(&self) -> Vec<String> {
        self.parameters
            .get("tasks")
            .and_then(Value::as_array)
            .map(|children| {
                children
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Child concurrency limit declared by a `parallel` task.
    pub fn child_concurrency(&self) -> Option<usize> {
        self.parameters
            .get("concurrency")
            .and_then(Value::as_u64)
            .map(|limit| limit as usize)
    }
}

/// Workflow definition: an identifier, default variables and the task DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier.
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// Definition version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Default variable bindings, overridden by request variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Tasks in declaration order.
    #[serde(default)]
    pub tasks: Vec<TaskDef>,

    /// Global error handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorHandling>,

    /// Overall execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: None,
            variables: HashMap::new(),
            tasks: Vec::new(),
            on_error: None,
            timeout_secs: None,
        }
    }

    /// Adds a task.
    pub fn with_task(mut self, task: TaskDef) -> Self {
        self.tasks.push(task);
        self
    }

    /// Sets a default variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Sets the error handling declaration.
    pub fn with_error_handling(mut self, handling: ErrorHandling) -> Self {
        self.on_error = Some(handling);
        self
    }

    /// Sets the overall timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Gets a task by ID.
    pub fn task(&self, task_id: &str) -> Option<&TaskDef> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// The effective error strategy (default `abort`).
    pub fn error_strategy(&self) -> ErrorStrategy {
        self.on_error
            .as_ref()
            .map(|h| h.strategy)
            .unwrap_or_default()
    }

    /// Direct dependents of a task.
    pub fn dependents(&self, task_id: &str) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.depends_on.iter().any(|dep| dep == task_id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Validates the definition: unique task IDs, known references, no
    /// cycles, and well-formed parallel/condition declarations.
    pub fn validate(&self) -> WorkflowResult<()> {
        let mut ids: HashSet<&str> = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(WorkflowError::InvalidDefinition(
                    "Task with empty id".to_string(),
                ));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "Duplicate task id '{}'",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(WorkflowError::InvalidDefinition(format!(
                        "Task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
            for follow_up in task.on_success.iter().chain(task.on_failure.iter()) {
                if !ids.contains(follow_up.as_str()) {
                    return Err(WorkflowError::InvalidDefinition(format!(
                        "Task '{}' references unknown follow-up task '{}'",
                        task.id, follow_up
                    )));
                }
            }
            match task.task_type {
                TaskType::Condition => {
                    if task.condition.is_none() {
                        return Err(WorkflowError::InvalidDefinition(format!(
                            "Condition task '{}' declares no condition expression",
                            task.id
                        )));
                    }
                }
                TaskType::Parallel => {
                    let children = task.child_task_ids();
                    if children.is_empty() {
                        return Err(WorkflowError::InvalidDefinition(format!(
                            "Parallel task '{}' declares no child tasks",
                            task.id
                        )));
                    }
                    for child in &children {
                        if !ids.contains(child.as_str()) {
                            return Err(WorkflowError::InvalidDefinition(format!(
                                "Parallel task '{}' references unknown child '{}'",
                                task.id, child
                            )));
                        }
                        if child == &task.id {
                            return Err(WorkflowError::InvalidDefinition(format!(
                                "Parallel task '{}' lists itself as a child",
                                task.id
                            )));
                        }
                    }
                }
                _ => {}
            }
        }

        self.build_dag().map(|_| ())
    }

    /// Builds the internal dependency DAG, failing on cycles.
    fn build_dag(&self) -> WorkflowResult<Dag<String, ()>> {
        let mut dag: Dag<String, ()> = Dag::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for task in &self.tasks {
            let node = dag.add_node(task.id.clone());
            nodes.insert(task.id.as_str(), node);
        }

        for task in &self.tasks {
            let to = nodes[task.id.as_str()];
            for dep in &task.depends_on {
                let from = nodes.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::InvalidDefinition(format!("Unknown dependency '{}'", dep))
                })?;
                dag.add_edge(*from, to, ())
                    .map_err(|_| WorkflowError::CycleDetected)?;
            }
        }

        Ok(dag)
    }

    /// Returns task IDs in topological order.
    pub fn topological_order(&self) -> WorkflowResult<Vec<String>> {
        let dag = self.build_dag()?;
        let sorted = daggy::petgraph::algo::toposort(&dag, None)
            .map_err(|_| WorkflowError::CycleDetected)?;
        Ok(sorted.into_iter().map(|idx| dag[idx].clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("pipeline")
            .with_task(TaskDef::new("extract", TaskType::Data))
            .with_task(TaskDef::new("summarize", TaskType::Ai).depends_on("extract"))
    }

    #[test]
    fn test_valid_definition() {
        assert!(linear_definition().validate().is_ok());
    }

    #[test]
    fn test_duplicate_task_id_rejected() {
        let definition = WorkflowDefinition::new("w")
            .with_task(TaskDef::new("a", TaskType::Data))
            .with_task(TaskDef::new("a", TaskType::Ai));

        assert!(matches!(
            definition.validate(),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let definition = WorkflowDefinition::new("w")
            .with_task(TaskDef::new("a", TaskType::Data).depends_on("ghost"));

        assert!(matches!(
            definition.validate(),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let definition = WorkflowDefinition::new("w")
            .with_task(TaskDef::new("a", TaskType::Data).depends_on("b"))
            .with_task(TaskDef::new("b", TaskType::Data).depends_on("a"));

        assert!(matches!(
            definition.validate(),
            Err(WorkflowError::CycleDetected)
        ));
    }

    #[test]
    fn test_topological_order() {
        let order = linear_definition().topological_order().unwrap();
        assert_eq!(order, vec!["extract".to_string(), "summarize".to_string()]);
    }

    #[test]
    fn test_parallel_children_validated() {
        let definition = WorkflowDefinition::new("w").with_task(
            TaskDef::new("fan", TaskType::Parallel)
                .with_parameter("tasks", json!(["ghost"])),
        );

        assert!(matches!(
            definition.validate(),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_condition_task_requires_expression() {
        let definition =
            WorkflowDefinition::new("w").with_task(TaskDef::new("branch", TaskType::Condition));

        assert!(matches!(
            definition.validate(),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_fixed_backoff_delays() {
        let policy = RetryPolicy::fixed(3, 100);

        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(4), None);
    }

    #[test]
    fn test_linear_backoff_delays() {
        let policy = RetryPolicy::linear(3, 100);

        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(5, 100, 500);

        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_zero_retries_never_delays() {
        let policy = RetryPolicy::fixed(0, 100);
        assert_eq!(policy.delay_for(1), None);
    }

    #[test]
    fn test_definition_deserializes_from_yaml() {
        let raw = r#"
id: enrich-pipeline
name: Enrich pipeline
variables:
  limit: 10
tasks:
  - id: fetch
    type: data
    parameters:
      operation: search
      query: "${query}"
  - id: enrich
    type: ai
    depends_on: [fetch]
    parameters:
      operation: enrich
    retry:
      max_retries: 2
      backoff: exponential
      initial_delay_ms: 50
      max_delay_ms: 400
on_error:
  strategy: continue
timeout_secs: 120
"#;
        let definition: WorkflowDefinition = serde_yaml::from_str(raw).unwrap();
        assert!(definition.validate().is_ok());
        assert_eq!(definition.tasks.len(), 2);
        assert_eq!(definition.error_strategy(), ErrorStrategy::Continue);

        let retry = definition.task("enrich").unwrap().retry.as_ref().unwrap();
        assert_eq!(retry.backoff, BackoffKind::Exponential);
        assert_eq!(retry.max_retries, 2);
    }
}

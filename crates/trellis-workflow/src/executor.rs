//! DAG executor: schedules ready tasks, drives retries, applies the
//! global error strategy, and brings every execution to a terminal state.

use crate::condition;
use crate::definition::{ErrorStrategy, TaskDef, TaskType, WorkflowDefinition};
use crate::dispatch::TaskDispatcher;
use crate::error::{WorkflowError, WorkflowResult};
use crate::registry::{ExecutionHandle, ExecutionRegistry};
use crate::state::ExecutionStatus;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the execution driver.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Applied when a definition declares no overall timeout.
    pub default_workflow_timeout: Duration,

    /// Grace period for in-flight tasks after cancellation or abort.
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_workflow_timeout: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome message sent by a finished task unit.
struct TaskCompletion {
    task_id: String,
    result: WorkflowResult<HashMap<String, Value>>,
}

/// Scheduling verdict after processing an event.
enum Control {
    Continue,
    Abort(String),
}

/// What woke the driver loop.
enum Wake {
    Completion(Option<TaskCompletion>),
    Cancelled,
    Deadline,
}

/// Drives workflow executions to a terminal state.
///
/// One driver runs per execution; it is the only mutator of the
/// execution's scheduling state, and task units only touch their own
/// task record.
pub struct DagExecutor {
    registry: Arc<ExecutionRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    config: ExecutorConfig,
}

impl DagExecutor {
    /// Creates an executor.
    pub fn new(
        registry: Arc<ExecutionRegistry>,
        dispatcher: Arc<TaskDispatcher>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    /// Runs one admitted execution to a terminal state.
    pub async fn run(
        &self,
        definition: WorkflowDefinition,
        handle: Arc<ExecutionHandle>,
    ) -> WorkflowResult<()> {
        definition.validate()?;

        let execution_id = handle.id().to_string();
        let timeout = definition
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_workflow_timeout);
        let deadline = Instant::now() + timeout;

        self.registry
            .update_status(&execution_id, ExecutionStatus::Running, |_| {})
            .await?;
        info!(
            "Execution {} running workflow '{}' ({} tasks)",
            execution_id,
            definition.id,
            definition.tasks.len()
        );

        // An empty workflow completes immediately.
        if definition.tasks.is_empty() {
            self.registry
                .update_status(&execution_id, ExecutionStatus::Completed, |_| {})
                .await?;
            return Ok(());
        }

        let driver = Driver::new(
            Arc::new(definition),
            Arc::clone(&handle),
            Arc::clone(&self.dispatcher),
            self.config.shutdown_timeout,
        )
        .await;
        let (status, error) = driver.drive(deadline).await;

        self.registry
            .update_status(&execution_id, status, |execution| {
                execution.error = error.clone();
            })
            .await?;
        info!("Execution {} finished as {}", execution_id, status);
        Ok(())
    }
}

/// Per-execution scheduling state.
struct Driver {
    definition: Arc<WorkflowDefinition>,
    handle: Arc<ExecutionHandle>,
    dispatcher: Arc<TaskDispatcher>,
    shutdown_timeout: Duration,
    execution_correlation_id: String,
    exec_cancel: CancellationToken,
    task_cancel: CancellationToken,

    /// Tasks allowed to schedule; gated tasks join on enablement.
    enabled: HashSet<String>,
    /// Unresolved gate references per gated task.
    gate_refs: HashMap<String, usize>,
    started: HashSet<String>,
    succeeded: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
    cancelled: HashSet<String>,
    running: HashMap<String, JoinHandle<()>>,
    /// Skipped tasks whose records still need the transition written.
    pending_skip_marks: Vec<String>,

    groups: HashMap<String, ParallelGroup>,
    child_group: HashMap<String, String>,
    global_retries: u32,

    completions_tx: mpsc::UnboundedSender<TaskCompletion>,
    completions_rx: mpsc::UnboundedReceiver<TaskCompletion>,
}

struct ParallelGroup {
    children: HashSet<String>,
    limit: Option<usize>,
    active: usize,
}

impl Driver {
    async fn new(
        definition: Arc<WorkflowDefinition>,
        handle: Arc<ExecutionHandle>,
        dispatcher: Arc<TaskDispatcher>,
        shutdown_timeout: Duration,
    ) -> Self {
        // Tasks referenced by a branch list or a parallel group are gated:
        // they only schedule once something enables them.
        let mut gate_refs: HashMap<String, usize> = HashMap::new();
        let mut groups = HashMap::new();
        let mut child_group = HashMap::new();

        for task in &definition.tasks {
            if task.task_type == TaskType::Parallel {
                let children: HashSet<String> = task.child_task_ids().into_iter().collect();
                for child in &children {
                    *gate_refs.entry(child.clone()).or_insert(0) += 1;
                    child_group.insert(child.clone(), task.id.clone());
                }
                groups.insert(
                    task.id.clone(),
                    ParallelGroup {
                        children,
                        limit: task.child_concurrency(),
                        active: 0,
                    },
                );
            }
            for follow_up in task.on_success.iter().chain(task.on_failure.iter()) {
                *gate_refs.entry(follow_up.clone()).or_insert(0) += 1;
            }
        }

        let enabled: HashSet<String> = definition
            .tasks
            .iter()
            .filter(|task| !gate_refs.contains_key(&task.id))
            .map(|task| task.id.clone())
            .collect();

        let (execution_correlation_id, exec_cancel) = (
            handle.update(|e| e.correlation_id.clone()).await,
            handle.cancel_token(),
        );
        let task_cancel = exec_cancel.child_token();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Self {
            definition,
            handle,
            dispatcher,
            shutdown_timeout,
            execution_correlation_id,
            exec_cancel,
            task_cancel,
            enabled,
            gate_refs,
            started: HashSet::new(),
            succeeded: HashSet::new(),
            failed: HashSet::new(),
            skipped: HashSet::new(),
            cancelled: HashSet::new(),
            running: HashMap::new(),
            pending_skip_marks: Vec::new(),
            groups,
            child_group,
            global_retries: 0,
            completions_tx,
            completions_rx,
        }
    }

    /// Main scheduling loop.
    async fn drive(mut self, deadline: Instant) -> (ExecutionStatus, Option<String>) {
        loop {
            if self.exec_cancel.is_cancelled() {
                return self.finish_cancelled().await;
            }
            if let Control::Abort(reason) = self.schedule_ready().await {
                return self.finish_aborted(reason).await;
            }
            if self.running.is_empty() {
                break;
            }

            let wake = {
                let cancelled = self.exec_cancel.clone();
                tokio::select! {
                    completion = self.completions_rx.recv() => Wake::Completion(completion),
                    _ = cancelled.cancelled() => Wake::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                }
            };

            match wake {
                Wake::Completion(Some(completion)) => {
                    if let Control::Abort(reason) = self.handle_completion(completion).await {
                        return self.finish_aborted(reason).await;
                    }
                }
                // The driver holds a sender, so this does not happen; treat
                // it as nothing left to wait for.
                Wake::Completion(None) => break,
                Wake::Cancelled => return self.finish_cancelled().await,
                Wake::Deadline => return self.finish_timed_out().await,
            }
        }

        // Whatever never became schedulable will not run anymore.
        self.skip_unstarted();
        self.flush_skip_marks().await;
        self.final_verdict()
    }

    fn final_verdict(&self) -> (ExecutionStatus, Option<String>) {
        if self.failed.is_empty() && self.cancelled.is_empty() {
            (ExecutionStatus::Completed, None)
        } else {
            let mut failed: Vec<&str> = self
                .failed
                .iter()
                .chain(self.cancelled.iter())
                .map(String::as_str)
                .collect();
            failed.sort_unstable();
            (
                ExecutionStatus::Failed,
                Some(format!("tasks failed: {}", failed.join(", "))),
            )
        }
    }

    /// Dispatches every currently ready task, running internal task types
    /// inline, until a pass makes no progress.
    async fn schedule_ready(&mut self) -> Control {
        let definition = Arc::clone(&self.definition);
        loop {
            let mut progressed = false;
            let variables = self.handle.update(|e| e.variables.clone()).await;

            for task in &definition.tasks {
                if !self.can_schedule(task) {
                    continue;
                }

                // Boolean guard: false keeps the task out of the ready set;
                // an unparseable expression fails it.
                if task.task_type != TaskType::Condition {
                    if let Some(guard) = &task.condition {
                        match condition::evaluate(&task.id, guard, &variables) {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(err) => {
                                progressed = true;
                                if let Control::Abort(reason) = self.fail_task(&task.id, &err).await
                                {
                                    return Control::Abort(reason);
                                }
                                continue;
                            }
                        }
                    }
                }

                progressed = true;
                match task.task_type {
                    TaskType::Condition => {
                        if let Control::Abort(reason) =
                            self.run_condition_task(task, &variables).await
                        {
                            return Control::Abort(reason);
                        }
                    }
                    TaskType::Parallel => self.start_parallel_task(task).await,
                    _ => self.spawn_task(task).await,
                }
            }

            match self.check_groups().await {
                (Control::Abort(reason), _) => return Control::Abort(reason),
                (Control::Continue, group_progress) => progressed |= group_progress,
            }
            self.flush_skip_marks().await;

            if !progressed {
                return Control::Continue;
            }
        }
    }

    fn is_marked(&self, task_id: &str) -> bool {
        self.started.contains(task_id)
            || self.skipped.contains(task_id)
            || self.failed.contains(task_id)
            || self.cancelled.contains(task_id)
    }

    fn is_terminal(&self, task_id: &str) -> bool {
        self.succeeded.contains(task_id)
            || self.failed.contains(task_id)
            || self.skipped.contains(task_id)
            || self.cancelled.contains(task_id)
    }

    fn can_schedule(&self, task: &TaskDef) -> bool {
        if self.is_marked(&task.id) || !self.enabled.contains(&task.id) {
            return false;
        }
        let deps_satisfied = task
            .depends_on
            .iter()
            .all(|dep| self.succeeded.contains(dep) || self.skipped.contains(dep));
        if !deps_satisfied {
            return false;
        }
        if let Some(group_id) = self.child_group.get(&task.id) {
            if let Some(group) = self.groups.get(group_id) {
                if let Some(limit) = group.limit {
                    if group.active >= limit {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Spawns the dispatch/retry unit for one backend task.
    async fn spawn_task(&mut self, task: &TaskDef) {
        let task = task.clone();
        let task_id = task.id.clone();
        debug!("Scheduling task '{}'", task_id);

        if let Some(group_id) = self.child_group.get(&task_id) {
            if let Some(group) = self.groups.get_mut(group_id) {
                group.active += 1;
            }
        }

        let handle = Arc::clone(&self.handle);
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = self.task_cancel.clone();
        let correlation_id = self.execution_correlation_id.clone();
        let completions = self.completions_tx.clone();

        let unit_task_id = task_id.clone();
        let join = tokio::spawn(async move {
            let result = run_task_unit(&task, handle, dispatcher, &correlation_id, cancel).await;
            let _ = completions.send(TaskCompletion {
                task_id: unit_task_id,
                result,
            });
        });

        self.started.insert(task_id.clone());
        self.running.insert(task_id, join);
    }

    /// Evaluates a condition task inline and enables the chosen branch;
    /// the unchosen branch is skipped.
    async fn run_condition_task(&mut self, task: &TaskDef, variables: &HashMap<String, Value>) -> Control {
        self.started.insert(task.id.clone());
        let expr = task.condition.as_deref().unwrap_or_default();

        match condition::evaluate(&task.id, expr, variables) {
            Ok(branch) => {
                debug!("Condition task '{}' evaluated to {}", task.id, branch);
                let mut output = HashMap::new();
                output.insert("result".to_string(), Value::Bool(branch));
                self.complete_task_record(&task.id, output).await;
                self.succeeded.insert(task.id.clone());

                let (chosen, unchosen) = if branch {
                    (task.on_success.clone(), task.on_failure.clone())
                } else {
                    (task.on_failure.clone(), task.on_success.clone())
                };
                for follow_up in chosen {
                    self.enable(&follow_up);
                }
                for follow_up in unchosen {
                    self.resolve_gate(&follow_up);
                }
                Control::Continue
            }
            Err(err) => self.fail_task(&task.id, &err).await,
        }
    }

    /// Starts a parallel aggregator: the task turns running and its
    /// children become eligible.
    async fn start_parallel_task(&mut self, task: &TaskDef) {
        debug!("Starting parallel task '{}'", task.id);
        self.started.insert(task.id.clone());
        self.mark_record(&task.id, |record| record.start()).await;

        let children = task.child_task_ids();
        for child in children {
            self.enable(&child);
        }
    }

    /// Completes parallel tasks whose children are all terminal; the
    /// second value reports whether any group changed state.
    async fn check_groups(&mut self) -> (Control, bool) {
        let ready: Vec<String> = self
            .groups
            .iter()
            .filter(|(group_id, group)| {
                self.started.contains(*group_id)
                    && !self.is_terminal(group_id)
                    && group.children.iter().all(|child| self.is_terminal(child))
            })
            .map(|(group_id, _)| group_id.clone())
            .collect();

        let progressed = !ready.is_empty();
        for group_id in ready {
            let failed_children: Vec<String> = {
                let group = &self.groups[&group_id];
                let mut failed: Vec<String> = group
                    .children
                    .iter()
                    .filter(|child| self.failed.contains(*child) || self.cancelled.contains(*child))
                    .cloned()
                    .collect();
                failed.sort_unstable();
                failed
            };

            if failed_children.is_empty() {
                let output = self.aggregate_group_output(&group_id).await;
                self.complete_task(&group_id, output).await;
            } else {
                let error = WorkflowError::Backend {
                    task_id: group_id.clone(),
                    reason: format!("child tasks failed: {}", failed_children.join(", ")),
                };
                if let Control::Abort(reason) = self.fail_task(&group_id, &error).await {
                    return (Control::Abort(reason), progressed);
                }
            }
        }
        (Control::Continue, progressed)
    }

    /// Collects the outputs of a group's completed children.
    async fn aggregate_group_output(&self, group_id: &str) -> HashMap<String, Value> {
        let children = self.groups[group_id].children.clone();
        self.handle
            .update(move |execution| {
                let mut output = HashMap::new();
                for child in &children {
                    if let Some(record) = execution.tasks.get(child) {
                        let object: serde_json::Map<String, Value> = record
                            .output
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        output.insert(child.clone(), Value::Object(object));
                    }
                }
                output
            })
            .await
    }

    /// Handles one task unit outcome.
    async fn handle_completion(&mut self, completion: TaskCompletion) -> Control {
        let task_id = completion.task_id;
        self.running.remove(&task_id);
        if let Some(group_id) = self.child_group.get(&task_id).cloned() {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.active = group.active.saturating_sub(1);
            }
        }

        match completion.result {
            Ok(output) => {
                self.complete_task(&task_id, output).await;
                Control::Continue
            }
            Err(WorkflowError::Cancelled(_)) => {
                // The caller's cancellation wins the race against the
                // completion event; record and let the driver observe it.
                self.mark_record(&task_id, |record| record.cancel()).await;
                self.cancelled.insert(task_id);
                Control::Continue
            }
            Err(err) => self.fail_task(&task_id, &err).await,
        }
    }

    /// Records a success, propagates outputs and fires success gates.
    async fn complete_task(&mut self, task_id: &str, output: HashMap<String, Value>) {
        self.complete_task_record(task_id, output).await;
        self.succeeded.insert(task_id.to_string());
        debug!("Task '{}' completed", task_id);

        if let Some(task) = self.definition.task(task_id) {
            let (on_success, on_failure) = (task.on_success.clone(), task.on_failure.clone());
            for follow_up in on_success {
                self.enable(&follow_up);
            }
            for follow_up in on_failure {
                self.resolve_gate(&follow_up);
            }
        }
    }

    async fn complete_task_record(&mut self, task_id: &str, output: HashMap<String, Value>) {
        let aliases = self
            .definition
            .task(task_id)
            .map(|task| task.variables.clone())
            .unwrap_or_default();
        let task_id_owned = task_id.to_string();
        let result = self
            .handle
            .update(move |execution| {
                // Inline tasks complete without a prior running transition.
                let record = execution.task_record(&task_id_owned);
                if record.started_at.is_none() {
                    let _ = record.start();
                }
                execution.record_task_success(&task_id_owned, output, &aliases)
            })
            .await;
        if let Err(err) = result {
            warn!("Recording success of task '{}' failed: {}", task_id, err);
        }
    }

    /// Records a terminal task failure and applies the global strategy.
    async fn fail_task(&mut self, task_id: &str, error: &WorkflowError) -> Control {
        warn!("Task '{}' failed: {}", task_id, error);
        let message = error.to_string();
        self.mark_record(task_id, move |record| record.fail(message))
            .await;
        self.failed.insert(task_id.to_string());

        match self.definition.error_strategy() {
            ErrorStrategy::Abort => Control::Abort(error.to_string()),
            ErrorStrategy::Continue => {
                let task = self.definition.task(task_id).cloned();
                if let Some(task) = task {
                    if task.on_failure.is_empty() {
                        for follow_up in &task.on_success {
                            self.resolve_gate(follow_up);
                        }
                        self.skip_subtree(task_id);
                    } else {
                        for follow_up in &task.on_failure {
                            self.enable(follow_up);
                        }
                        for follow_up in &task.on_success {
                            self.resolve_gate(follow_up);
                        }
                    }
                }
                Control::Continue
            }
            ErrorStrategy::Retry => {
                let budget = self
                    .definition
                    .on_error
                    .as_ref()
                    .and_then(|handling| handling.max_retries)
                    .unwrap_or(1);
                if self.global_retries < budget {
                    self.global_retries += 1;
                    info!(
                        "Resetting failed task '{}' (workflow retry {}/{})",
                        task_id, self.global_retries, budget
                    );
                    self.mark_record(task_id, |record| record.reset()).await;
                    self.failed.remove(task_id);
                    self.started.remove(task_id);
                    Control::Continue
                } else {
                    Control::Abort(format!(
                        "workflow retry budget exhausted after task '{}' failed: {}",
                        task_id, error
                    ))
                }
            }
        }
    }

    fn enable(&mut self, task_id: &str) {
        if self.enabled.insert(task_id.to_string()) {
            debug!("Task '{}' enabled", task_id);
        }
    }

    /// Resolves one gate reference without enabling; a task whose gates
    /// all resolve this way is skipped.
    fn resolve_gate(&mut self, task_id: &str) {
        if self.enabled.contains(task_id) || self.is_marked(task_id) {
            return;
        }
        let remaining = match self.gate_refs.get_mut(task_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            self.mark_skip(task_id.to_string());
        }
    }

    /// Marks a task skipped and resolves the gates it would have fired.
    fn mark_skip(&mut self, task_id: String) {
        if self.is_terminal(&task_id) || self.started.contains(&task_id) {
            return;
        }
        debug!("Task '{}' skipped", task_id);
        self.skipped.insert(task_id.clone());
        self.pending_skip_marks.push(task_id.clone());

        if let Some(task) = self.definition.task(&task_id) {
            let follow_ups: Vec<String> = task
                .on_success
                .iter()
                .chain(task.on_failure.iter())
                .cloned()
                .collect();
            let children = if task.task_type == TaskType::Parallel {
                task.child_task_ids()
            } else {
                Vec::new()
            };
            for follow_up in follow_ups.into_iter().chain(children) {
                self.resolve_gate(&follow_up);
            }
        }
    }

    /// Transitively skips the dependents of a failed task.
    fn skip_subtree(&mut self, task_id: &str) {
        let dependents: Vec<String> = self
            .definition
            .dependents(task_id)
            .into_iter()
            .map(str::to_string)
            .collect();
        for dependent in dependents {
            if !self.is_marked(&dependent) && !self.succeeded.contains(&dependent) {
                self.mark_skip(dependent.clone());
                self.skip_subtree(&dependent);
            }
        }
    }

    /// Marks every task that never became schedulable as skipped.
    fn skip_unstarted(&mut self) {
        let unstarted: Vec<String> = self
            .definition
            .tasks
            .iter()
            .filter(|task| !self.started.contains(&task.id) && !self.is_terminal(&task.id))
            .map(|task| task.id.clone())
            .collect();
        for task_id in unstarted {
            self.mark_skip(task_id);
        }
    }

    /// Writes the skipped transitions collected by the sync bookkeeping.
    async fn flush_skip_marks(&mut self) {
        let marks = std::mem::take(&mut self.pending_skip_marks);
        if marks.is_empty() {
            return;
        }
        self.handle
            .update(move |execution| {
                for task_id in marks {
                    if let Err(err) = execution.task_record(&task_id).skip() {
                        debug!("Skip mark for '{}' not applied: {}", task_id, err);
                    }
                }
            })
            .await;
    }

    /// Applies a record mutation, logging instead of failing on illegal
    /// transitions (the record may already be terminal during teardown).
    async fn mark_record(
        &self,
        task_id: &str,
        mutate: impl FnOnce(&mut crate::state::TaskRecord) -> WorkflowResult<()> + Send + 'static,
    ) {
        let task_id_owned = task_id.to_string();
        let result = self
            .handle
            .update(move |execution| mutate(execution.task_record(&task_id_owned)))
            .await;
        if let Err(err) = result {
            debug!("Record update for task '{}' not applied: {}", task_id, err);
        }
    }

    /// Abort teardown: stop in-flight tasks, then fail the execution.
    async fn finish_aborted(mut self, reason: String) -> (ExecutionStatus, Option<String>) {
        warn!("Aborting execution: {}", reason);
        self.teardown().await;
        (ExecutionStatus::Failed, Some(reason))
    }

    /// Caller-initiated cancellation teardown.
    async fn finish_cancelled(mut self) -> (ExecutionStatus, Option<String>) {
        let reason = self
            .handle
            .update(|execution| execution.metadata.get("cancel_reason").cloned())
            .await
            .unwrap_or_else(|| "cancelled".to_string());
        info!("Cancelling execution: {}", reason);
        self.teardown().await;
        (ExecutionStatus::Cancelled, Some(reason))
    }

    /// Workflow deadline teardown.
    async fn finish_timed_out(mut self) -> (ExecutionStatus, Option<String>) {
        let error = WorkflowError::ExecutionTimeout(self.handle.id().to_string());
        warn!("{}", error);
        self.teardown().await;
        (ExecutionStatus::Failed, Some(error.to_string()))
    }

    /// Signals in-flight tasks, waits out the shutdown grace, then
    /// forcibly marks whatever is still running as cancelled and skips
    /// everything that never started.
    async fn teardown(&mut self) {
        self.task_cancel.cancel();

        let grace = Instant::now() + self.shutdown_timeout;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(grace, self.completions_rx.recv()).await {
                Ok(Some(completion)) => self.settle_completion(completion).await,
                Ok(None) | Err(_) => break,
            }
        }

        let leftovers: Vec<(String, JoinHandle<()>)> = self.running.drain().collect();
        for (task_id, join) in leftovers {
            join.abort();
            self.mark_record(&task_id, |record| record.cancel()).await;
            self.cancelled.insert(task_id);
        }

        self.skip_unstarted();
        self.flush_skip_marks().await;
    }

    /// Records outcomes during teardown without strategy side effects.
    async fn settle_completion(&mut self, completion: TaskCompletion) {
        let task_id = completion.task_id;
        self.running.remove(&task_id);
        match completion.result {
            Ok(output) => {
                self.complete_task_record(&task_id, output).await;
                self.succeeded.insert(task_id);
            }
            Err(WorkflowError::Cancelled(_)) => {
                self.mark_record(&task_id, |record| record.cancel()).await;
                self.cancelled.insert(task_id);
            }
            Err(err) => {
                let message = err.to_string();
                self.mark_record(&task_id, move |record| record.fail(message))
                    .await;
                self.failed.insert(task_id);
            }
        }
    }
}

/// Dispatch/retry loop for one backend task.
///
/// A task dispatches at most `max_retries + 1` times; between attempts it
/// sits in `retrying` for the backoff delay. Cancellation interrupts both
/// the in-flight call and the backoff sleep.
async fn run_task_unit(
    task: &TaskDef,
    handle: Arc<ExecutionHandle>,
    dispatcher: Arc<TaskDispatcher>,
    execution_correlation_id: &str,
    cancel: CancellationToken,
) -> WorkflowResult<HashMap<String, Value>> {
    let mut attempt: u32 = 0;
    loop {
        let task_id = task.id.clone();
        handle
            .update(move |execution| execution.task_record(&task_id).start())
            .await?;
        let variables = handle.update(|execution| execution.variables.clone()).await;

        let result = dispatcher
            .dispatch(task, &variables, execution_correlation_id, attempt, &cancel)
            .await;

        match result {
            Ok(output) => return Ok(output),
            Err(err @ WorkflowError::Cancelled(_)) => return Err(err),
            Err(err) => {
                let next_attempt = attempt + 1;
                let delay = task
                    .retry
                    .as_ref()
                    .and_then(|policy| policy.delay_for(next_attempt));

                match delay {
                    Some(delay) => {
                        warn!(
                            "Task '{}' attempt {} failed, retrying in {:?}: {}",
                            task.id, next_attempt, delay, err
                        );
                        let task_id = task.id.clone();
                        let message = err.to_string();
                        handle
                            .update(move |execution| {
                                execution.task_record(&task_id).retrying(message)
                            })
                            .await?;

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return Err(WorkflowError::Cancelled(task.id.clone()));
                            }
                        }
                        attempt = next_attempt;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

//! Execution registry: admission control, live records and TTL cleanup.

use crate::error::{WorkflowError, WorkflowResult};
use crate::state::{ExecutionStatus, WorkflowExecution};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum live (non-terminal) executions.
    pub max_concurrent: usize,

    /// Retention of terminal records before cleanup.
    pub execution_ttl: Duration,

    /// Cleanup pass interval.
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            execution_ttl: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Shared handle to one execution record.
///
/// The record lives behind its own mutex; the registry map lock is never
/// held while a record is locked.
pub struct ExecutionHandle {
    execution_id: String,
    record: Mutex<WorkflowExecution>,
    cancel: CancellationToken,
    terminal: AtomicBool,
}

impl ExecutionHandle {
    fn new(execution: WorkflowExecution) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            record: Mutex::new(execution),
            cancel: CancellationToken::new(),
            terminal: AtomicBool::new(false),
        }
    }

    /// The execution ID.
    pub fn id(&self) -> &str {
        &self.execution_id
    }

    /// Clones the execution's cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True once the execution reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    /// Runs a closure against the locked record.
    pub async fn update<R>(&self, f: impl FnOnce(&mut WorkflowExecution) -> R) -> R {
        let mut record = self.record.lock().await;
        f(&mut record)
    }

    /// Clones the current record.
    pub async fn snapshot(&self) -> WorkflowExecution {
        self.record.lock().await.clone()
    }
}

/// In-memory mapping from execution ID to live execution records, with a
/// bounded admission gate.
pub struct ExecutionRegistry {
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
    live: AtomicUsize,
    next_id: AtomicU64,
    config: RegistryConfig,
}

impl ExecutionRegistry {
    /// Creates a registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            config,
        }
    }

    fn allocate_id(&self) -> String {
        format!("exec-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Atomically admits a new execution in `pending` state, or rejects
    /// with `RegistryBusy` when capacity is saturated.
    pub fn admit(
        &self,
        workflow_id: &str,
        correlation_id: &str,
        variables: HashMap<String, Value>,
    ) -> WorkflowResult<Arc<ExecutionHandle>> {
        let mut executions = self.executions.write();

        let running = self.live.load(Ordering::SeqCst);
        if running >= self.config.max_concurrent {
            warn!(
                "Admission rejected for workflow '{}': {} of {} slots in use",
                workflow_id, running, self.config.max_concurrent
            );
            return Err(WorkflowError::RegistryBusy {
                running,
                max: self.config.max_concurrent,
            });
        }
        self.live.fetch_add(1, Ordering::SeqCst);

        let execution_id = self.allocate_id();
        let execution = WorkflowExecution::new(
            execution_id.clone(),
            workflow_id,
            correlation_id,
            variables,
        );
        let handle = Arc::new(ExecutionHandle::new(execution));
        executions.insert(execution_id.clone(), handle.clone());

        info!(
            "Admitted execution {} for workflow '{}'",
            execution_id, workflow_id
        );
        Ok(handle)
    }

    /// Gets an execution handle by ID.
    pub fn get(&self, execution_id: &str) -> WorkflowResult<Arc<ExecutionHandle>> {
        self.executions
            .read()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))
    }

    /// Transitions an execution's status, rejecting illegal transitions,
    /// then applies the mutator under the same record lock.
    ///
    /// This is the only path for execution status changes; it keeps the
    /// live-count admission invariant in step with terminal transitions.
    pub async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        mutator: impl FnOnce(&mut WorkflowExecution),
    ) -> WorkflowResult<()> {
        let handle = self.get(execution_id)?;
        handle
            .update(|execution| {
                execution.transition(status)?;
                mutator(execution);
                Ok::<_, WorkflowError>(())
            })
            .await?;

        if status.is_terminal() && !handle.terminal.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Signals cancellation to a live execution.
    ///
    /// The driver observes the token and transitions the record; a cancel
    /// after the execution became terminal returns `AlreadyTerminal`.
    pub async fn cancel(&self, execution_id: &str, reason: &str) -> WorkflowResult<()> {
        let handle = self.get(execution_id)?;
        if handle.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal(execution_id.to_string()));
        }

        let reason = reason.to_string();
        handle
            .update(|execution| {
                execution
                    .metadata
                    .insert("cancel_reason".to_string(), reason)
            })
            .await;

        info!("Cancellation requested for execution {}", execution_id);
        handle.cancel.cancel();
        Ok(())
    }

    /// Number of live (non-terminal) executions.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of retained records, terminal included.
    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    /// IDs of all retained executions.
    pub fn execution_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executions.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// True when no records are retained.
    pub fn is_empty(&self) -> bool {
        self.executions.read().is_empty()
    }

    /// Per-status execution counts.
    pub async fn stats(&self) -> HashMap<String, usize> {
        let handles: Vec<Arc<ExecutionHandle>> =
            self.executions.read().values().cloned().collect();

        let mut stats = HashMap::new();
        stats.insert("total".to_string(), handles.len());
        for handle in handles {
            let status = handle.update(|execution| execution.status).await;
            *stats.entry(status.to_string()).or_insert(0) += 1;
        }
        stats
    }

    /// Removes terminal records older than the TTL; returns the count.
    pub async fn purge_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.execution_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        let candidates: Vec<Arc<ExecutionHandle>> = self
            .executions
            .read()
            .values()
            .filter(|handle| handle.is_terminal())
            .cloned()
            .collect();

        let mut expired = Vec::new();
        for handle in candidates {
            let ended_at = handle.update(|execution| execution.ended_at).await;
            if matches!(ended_at, Some(ended) if ended < cutoff) {
                expired.push(handle.execution_id.clone());
            }
        }

        if !expired.is_empty() {
            let mut executions = self.executions.write();
            for execution_id in &expired {
                executions.remove(execution_id);
                debug!("Purged expired execution {}", execution_id);
            }
        }
        expired.len()
    }

    /// Spawns the periodic cleanup loop.
    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = registry.purge_expired().await;
                        if purged > 0 {
                            info!("Cleanup removed {} expired executions", purged);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Registry cleanup loop stopped");
                        return;
                    }
                }
            }
        })
    }
}

//! # Trellis Workflow Engine
//!
//! The execution core of the Trellis workflow platform: typed task DAGs
//! rendered from templates, executed against downstream worker services
//! over the bus, with retries, conditional branching, cancellation and
//! bounded-concurrency admission.
//!
//! ## Components
//!
//! - **Definition**: [`WorkflowDefinition`] / [`TaskDef`] with validation
//!   (unique IDs, known references, acyclicity)
//! - **State**: workflow and task state machines with transition legality
//! - **Registry**: [`ExecutionRegistry`] holding live executions behind an
//!   admission gate with TTL cleanup
//! - **Templates**: [`TemplateStore`] rendering definitions from on-disk
//!   documents and a declared variable schema
//! - **Dispatch**: [`TaskDispatcher`] routing typed tasks to backend
//!   services through the correlation layer
//! - **Executor**: [`DagExecutor`] driving executions to a terminal state
//!
//! ## Example
//!
//! ```rust
//! use trellis_workflow::{TaskDef, TaskType, WorkflowDefinition};
//! use serde_json::json;
//!
//! let definition = WorkflowDefinition::new("graph-summary")
//!     .with_task(
//!         TaskDef::new("a", TaskType::Data)
//!             .with_parameter("operation", json!("traverse"))
//!             .with_parameter("cypher", json!("MATCH (n) RETURN n LIMIT ${limit}")),
//!     )
//!     .with_task(
//!         TaskDef::new("b", TaskType::Ai)
//!             .depends_on("a")
//!             .with_parameter("operation", json!("summarize"))
//!             .with_parameter("text", json!("${tasks.a.nodes}")),
//!     )
//!     .with_variable("limit", json!(10));
//!
//! assert!(definition.validate().is_ok());
//! ```

pub mod condition;
pub mod definition;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod params;
pub mod registry;
pub mod scope;
pub mod state;
pub mod templates;

// Re-export commonly used types
pub use definition::{
    BackoffKind, ErrorHandling, ErrorStrategy, RetryPolicy, TaskDef, TaskType, WorkflowDefinition,
};
pub use dispatch::{ServiceTimeouts, TaskDispatcher};
pub use error::{WorkflowError, WorkflowResult};
pub use executor::{DagExecutor, ExecutorConfig};
pub use registry::{ExecutionHandle, ExecutionRegistry, RegistryConfig};
pub use state::{ExecutionStatus, TaskRecord, TaskStatus, WorkflowExecution};
pub use templates::{TemplateStore, TemplateVariable, VariableType, WorkflowTemplate};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::definition::{
        BackoffKind, ErrorHandling, ErrorStrategy, RetryPolicy, TaskDef, TaskType,
        WorkflowDefinition,
    };
    pub use crate::dispatch::{ServiceTimeouts, TaskDispatcher};
    pub use crate::error::{WorkflowError, WorkflowResult};
    pub use crate::executor::{DagExecutor, ExecutorConfig};
    pub use crate::registry::{ExecutionHandle, ExecutionRegistry, RegistryConfig};
    pub use crate::state::{ExecutionStatus, TaskRecord, TaskStatus, WorkflowExecution};
    pub use crate::templates::{TemplateStore, TemplateVariable, VariableType, WorkflowTemplate};
}

/// Current version of the workflow engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

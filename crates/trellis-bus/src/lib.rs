//! # Trellis Bus
//!
//! Message-bus plumbing for the Trellis workflow platform: the abstract
//! pub/sub adapter, the wire protocol payloads, and the correlation layer
//! that turns in-process service calls into asynchronous request/response
//! round-trips over named channels.
//!
//! ## Components
//!
//! - **Adapter**: [`BusAdapter`] seam with an in-process [`InMemoryBus`]
//!   implementation for tests and self-contained local runs
//! - **Protocol**: request/response payloads and the channel table shared
//!   with the downstream worker services
//! - **Correlation**: [`CorrelationTable`] pairing outbound requests with
//!   awaiters by correlation ID under timeout and cancellation
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use trellis_bus::{CorrelationTable, InMemoryBus, ServiceRequest, DATA_ROUTE};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(InMemoryBus::new());
//!     let table = Arc::new(CorrelationTable::new(bus));
//!     table.start_response_pump(DATA_ROUTE.response).await?;
//!
//!     let request = ServiceRequest {
//!         correlation_id: "c1-a".to_string(),
//!         operation: "traverse".to_string(),
//!         parameters: Default::default(),
//!         timeout_secs: Some(60),
//!     };
//!     let response = table
//!         .call(DATA_ROUTE, request, Duration::from_secs(60), &CancellationToken::new())
//!         .await?;
//!     println!("success: {}", response.success);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod correlation;
pub mod error;
pub mod protocol;

// Re-export commonly used types
pub use adapter::{BusAdapter, BusSubscription, InMemoryBus, SubscriberId};
pub use correlation::CorrelationTable;
pub use error::{BusError, BusResult};
pub use protocol::{
    Operation, ServiceRequest, ServiceResponse, ServiceRoute, TaskResultSummary, WorkflowRequest,
    WorkflowResponse, AI_ROUTE, CAPABILITY_ANNOUNCEMENTS, DATA_ROUTE, EXEC_ROUTE, SERVICE_ROUTES,
    WORKFLOW_REQUESTS, WORKFLOW_RESPONSES,
};

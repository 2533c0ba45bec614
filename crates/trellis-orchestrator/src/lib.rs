//! # Trellis Orchestrator
//!
//! The bus-facing service of the Trellis workflow platform. It consumes
//! `WorkflowRequest` payloads from the request channel, renders workflow
//! definitions from templates (or an AI-generated brief), admits them into
//! the execution registry, drives them through the DAG executor, and
//! publishes exactly one terminal `WorkflowResponse` per execution.
//!
//! The binary in `main.rs` wires the orchestrator over the in-process bus
//! for self-contained local runs; a broker-backed [`trellis_bus::BusAdapter`]
//! implementation plugs into the same seam for deployment.

pub mod capabilities;
pub mod config;
pub mod service;

pub use config::{LoggingConfig, OrchestratorConfig};
pub use service::Orchestrator;

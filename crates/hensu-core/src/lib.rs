//! Hensu: an embeddable runtime for AI-agent-driven workflows.
//!
//! A `Workflow` is a graph of typed nodes (C2) connected by transition
//! rules (C5); `Executor` (C9) drives a `HensuState` through that graph
//! node by node, running each node's variant-specific logic (C3)
//! through a fixed processor pipeline (C4) that handles output
//! extraction, human review (C8), rubric scoring and auto-backtrack
//! (C6), and transition selection. `Environment` composes the executor
//! with crash-recoverable persistence (C10) and lease heartbeating.

pub mod action;
pub mod agent;
pub mod backoff;
pub mod cancellation;
pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod observability;
pub mod persistence;
pub mod plan;
pub mod registry;
pub mod review;
pub mod rubric;
pub mod state;
pub mod validator;
pub mod workflow;

pub use environment::Environment;
pub use error::{HensuError, Result};
pub use observability::init_tracing;

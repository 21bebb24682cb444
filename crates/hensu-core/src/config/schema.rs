use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `hensu.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HensuConfig {
    pub runtime: RuntimeConfig,
    pub lease: LeaseConfig,
    pub plan: PlanDefaultsConfig,
}

impl Default for HensuConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            lease: LeaseConfig::default(),
            plan: PlanDefaultsConfig::default(),
        }
    }
}

/// Execution scheduling and step-cap options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Use Tokio's cooperative task scheduling instead of a fixed-size
    /// worker pool for node execution.
    pub use_virtual_threads: bool,
    /// Worker thread count when `use_virtual_threads` is false.
    pub thread_pool_size: usize,
    /// Route unresolved agent ids to `StubAgent` instead of failing.
    pub stub_enabled: bool,
    /// Hard cap on nodes visited in a single `Executor::drive` run.
    pub max_execution_steps: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            use_virtual_threads: true,
            thread_pool_size: 4,
            stub_enabled: false,
            max_execution_steps: 10_000,
        }
    }
}

/// Lease heartbeat and staleness tuning for `LeaseManager` and
/// `reclaim_stale_executions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LeaseConfig {
    pub heartbeat_interval_seconds: u64,
    pub lease_stale_threshold_seconds: u64,
    /// Random jitter added to each heartbeat tick so many nodes don't
    /// contend on the same instant.
    pub heartbeat_jitter_seconds: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 15,
            lease_stale_threshold_seconds: 60,
            heartbeat_jitter_seconds: 3,
        }
    }
}

/// Defaults applied to a node's `PlanConstraints` when the workflow
/// definition doesn't override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PlanDefaultsConfig {
    pub default_plan_max_steps: usize,
    pub default_plan_max_replans: u32,
    pub default_plan_timeout_seconds: u64,
}

impl Default for PlanDefaultsConfig {
    fn default() -> Self {
        Self {
            default_plan_max_steps: 50,
            default_plan_max_replans: 3,
            default_plan_timeout_seconds: 300,
        }
    }
}

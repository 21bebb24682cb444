//! Agent contract and registry — the external-interface boundary the
//! core consumes (`Agent.execute(prompt, context) -> AgentResponse`).
//!
//! Concrete model clients live outside this crate; a `StubAgentProvider`
//! is shipped here so the engine is runnable and testable without one,
//! the same role `SimulatedExecutor` plays for node execution in the
//! teacher codebase.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::plan::Plan;
use crate::workflow::model::AgentConfig;
use crate::{HensuError, Result};

/// A plain-text agent response.
#[derive(Debug, Clone)]
pub struct TextResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: Option<u64>,
}

/// A request by the agent to invoke one or more tools, to be handed to
/// the plan sub-state-machine when the node allows planning.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tool_name: String,
    pub arguments: HashMap<String, Value>,
}

/// Variant carrying the four shapes an agent call can return (§4.2,
/// §6).
#[derive(Debug, Clone)]
pub enum AgentResponse {
    Text(TextResponse),
    ToolRequest(ToolRequest),
    PlanProposal(Plan),
    Error(String),
}

/// A configured language-model caller. Implementations wrap whatever
/// provider-specific client the adapter layer supplies.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        context: &HashMap<String, Value>,
    ) -> Result<AgentResponse>;
}

/// A factory for agents backed by a specific model family. Adapters
/// register one of these per provider; the registry picks the
/// highest-`priority` supporter for a given model name (§6).
pub trait AgentProvider: Send + Sync {
    fn supports_model(&self, model: &str) -> bool;
    fn priority(&self) -> i32;
    fn create_agent(&self, id: &str, config: &AgentConfig) -> Result<Arc<dyn Agent>>;
}

/// Stub agent used when no real provider is configured (`stub_enabled`
/// in `HensuConfig`), or as a built-in fallback at priority 1000.
pub struct StubAgent {
    pub model: String,
}

#[async_trait]
impl Agent for StubAgent {
    async fn execute(
        &self,
        prompt: &str,
        _context: &HashMap<String, Value>,
    ) -> Result<AgentResponse> {
        Ok(AgentResponse::Text(TextResponse {
            content: format!("stub response for prompt: {prompt}"),
            model: self.model.clone(),
            tokens_used: Some(0),
        }))
    }
}

/// Built-in stub provider; intercepts all models when
/// `config.stub_enabled` is set, at priority 1000 (§6).
pub struct StubAgentProvider;

impl AgentProvider for StubAgentProvider {
    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn create_agent(&self, _id: &str, config: &AgentConfig) -> Result<Arc<dyn Agent>> {
        Ok(Arc::new(StubAgent {
            model: config.model.clone(),
        }))
    }
}

/// Process-wide registry mapping agent ids (as declared in a
/// `Workflow`) to live `Agent` instances, resolved lazily via the
/// highest-priority `AgentProvider` that supports the configured model.
pub struct AgentRegistry {
    providers: RwLock<Vec<Arc<dyn AgentProvider>>>,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn AgentProvider>) {
        self.providers.write().unwrap().push(provider);
    }

    /// Register a pre-built agent directly under `id`, bypassing
    /// provider resolution (used by tests and the stub path).
    pub fn register_agent(&self, id: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.write().unwrap().insert(id.into(), agent);
    }

    /// Resolve (and cache) the agent for `id`, consulting `config` to
    /// pick a provider by model if not already registered directly.
    pub fn resolve(&self, id: &str, config: &AgentConfig) -> Result<Arc<dyn Agent>> {
        if let Some(agent) = self.agents.read().unwrap().get(id) {
            return Ok(Arc::clone(agent));
        }

        let providers = self.providers.read().unwrap();
        let best = providers
            .iter()
            .filter(|p| p.supports_model(&config.model))
            .max_by_key(|p| p.priority())
            .cloned();
        drop(providers);

        let provider = best.ok_or_else(|| HensuError::ProviderMissingForModel(config.model.clone()))?;
        let agent = provider.create_agent(id, config)?;
        self.agents
            .write()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().unwrap().get(id).cloned()
    }
}

//! Action execution: the dispatch surface for `ActionNode` and for tool
//! invocations issued by a running `Plan`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::{HensuError, Result};

/// A single resolved invocation: a handler id plus its (already
/// template-resolved) arguments.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub handler_id: String,
    pub payload: HashMap<String, Value>,
}

/// Executes named actions. Implementations may dispatch to in-process
/// handlers, external processes, or remote services; the engine only
/// depends on this trait.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, invocation: &ActionInvocation) -> Result<Value>;
}

type Handler = Box<dyn Fn(&HashMap<String, Value>) -> Result<Value> + Send + Sync>;

/// Default `ActionExecutor` backed by a map of synchronous, in-process
/// closures registered by id. Covers the common case where an action
/// handler is plain Rust code rather than an external process.
#[derive(Default)]
pub struct InProcessActionExecutor {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl InProcessActionExecutor {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&mut self, id: impl Into<String>, handler: F)
    where
        F: Fn(&HashMap<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(id.into(), Box::new(handler));
    }
}

#[async_trait]
impl ActionExecutor for InProcessActionExecutor {
    async fn execute(&self, invocation: &ActionInvocation) -> Result<Value> {
        let handlers = self.handlers.read().unwrap();
        let handler = handlers
            .get(&invocation.handler_id)
            .ok_or_else(|| HensuError::ActionHandlerMissing(invocation.handler_id.clone()))?;
        handler(&invocation.payload)
    }
}

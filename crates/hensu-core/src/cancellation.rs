//! Cooperative cancellation flag for an in-flight execution (§5).
//!
//! Checked at node boundaries, before/after plan steps, and around
//! branch joins; observing a cancelled token is treated the same as
//! any other fatal `NodeExecutor` error (`HensuError::Cancelled`) so it
//! flows through the engine's existing failure path rather than adding
//! a new `ExecutionResult` variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// A cheaply cloneable flag shared between whoever requests cancellation
/// and every collaborator polling it during a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process-wide map from a running execution to the token that can
/// cancel it, so `Environment::cancel` can reach a run it didn't keep a
/// direct handle to.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: std::sync::RwLock<std::collections::HashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, execution_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.write().unwrap().insert(execution_id, token.clone());
        token
    }

    pub fn unregister(&self, execution_id: Uuid) {
        self.tokens.write().unwrap().remove(&execution_id);
    }

    /// Returns `true` if an in-flight execution with this id was found
    /// and cancelled; `false` if it's not currently registered (already
    /// finished, or never started).
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.tokens.read().unwrap().get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

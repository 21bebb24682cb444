//! Tool registry and `{key}`-style template resolution (C11).

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static description of a tool an agent is permitted to call. Kept
/// separate from the `ActionExecutor`'s handler map: this is metadata
/// (name, description, schema) surfaced to agents when building
/// prompts, not the dispatch itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub description: String,
    pub parameters: Value,
}

/// Process-wide registry of tool definitions, keyed by id.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: ToolDefinition) {
        self.tools.write().unwrap().insert(tool.id.clone(), tool);
    }

    pub fn get(&self, id: &str) -> Option<ToolDefinition> {
        self.tools.read().unwrap().get(id).cloned()
    }

    pub fn subset(&self, ids: &[String]) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap();
        ids.iter().filter_map(|id| tools.get(id).cloned()).collect()
    }
}

/// Resolves `{key}` placeholders in a template string against a JSON
/// context map. Unresolvable keys are left untouched rather than
/// erroring, mirroring loose prompt-template substitution elsewhere in
/// the corpus.
pub struct TemplateResolver;

impl TemplateResolver {
    pub fn resolve(&self, template: &str, context: &HashMap<String, Value>) -> String {
        let mut out = String::with_capacity(template.len());
        let bytes = template.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'{' {
                if let Some(end) = template[i..].find('}') {
                    let key = &template[i + 1..i + end];
                    if !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                        if let Some(value) = context.get(key) {
                            out.push_str(&value_to_string(value));
                            i += end + 1;
                            continue;
                        }
                    }
                }
            }
            let ch = template[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
        out
    }

    /// Keys referenced by `{key}` placeholders in `template`, useful for
    /// validating a node declares the context it needs.
    pub fn referenced_keys(&self, template: &str) -> HashSet<String> {
        let mut keys = HashSet::new();
        let bytes = template.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'{' {
                if let Some(end) = template[i..].find('}') {
                    let key = &template[i + 1..i + end];
                    if !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                        keys.insert(key.to_string());
                    }
                    i += end + 1;
                    continue;
                }
            }
            i += 1;
        }
        keys
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

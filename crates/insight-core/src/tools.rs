//! Tool trait and the per-context tool registry

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::llm::ToolDefinition;
use crate::models::ToolInput;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Execution(String),
}

/// Who a tool is acting for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolContext {
    pub conversation_id: String,
    pub user_name: Option<String>,
    pub project_name: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Sent verbatim to the model
    fn description(&self) -> &str;
    /// JSON Schema object describing the input
    fn parameter_schema(&self) -> Value;
    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Ordered name -> tool map
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

/// Builds a fresh registry for each orchestration context
pub type RegistryFactory = Arc<dyn Fn() -> ToolRegistry + Send + Sync>;

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&slot) => {
                warn!("Tool '{}' is already registered. Replacing.", name);
                self.tools[slot] = tool;
            }
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&slot| &self.tools[slot])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names in registration order
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Declarations in registration order, ready for an LLM request
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameter_schema(),
            })
            .collect()
    }

    /// Validate input against the tool's required fields, then delegate.
    /// The tool's own error is returned untouched.
    pub async fn execute(
        &self,
        name: &str,
        input: &ToolInput,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        validate_required(&tool.parameter_schema(), input)?;
        tool.execute(input, ctx).await
    }
}

fn validate_required(schema: &Value, input: &ToolInput) -> Result<(), ToolError> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };

    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| input.get(*key).map_or(true, Value::is_null))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidInput(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )))
    }
}

/// Text form of a tool's output, as fed back to the model
pub fn render_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

pub fn required_str<'a>(input: &'a ToolInput, key: &str) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidInput(format!("'{}' must be a string", key)))
}

pub fn optional_str<'a>(input: &'a ToolInput, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

/// Integers are also accepted as numeric strings
pub fn optional_u64(input: &ToolInput, key: &str) -> Option<u64> {
    match input.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn optional_bool(input: &ToolInput, key: &str) -> Option<bool> {
    match input.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

//! Tool system: the `Tool` trait, the registry with JSON-schema argument
//! validation, and the per-turn loop detector.

pub mod loop_guard;
pub mod memory;
pub mod process;
pub mod pulse;
pub mod tasks;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::provider::ToolDefinition;

pub use loop_guard::LoopDetector;

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait that all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "memory_search").
    fn name(&self) -> &str;
    /// Human-readable description shown to the LLM.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given input.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Named callable units with schemas; invocation validates arguments first.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// API-level definitions for every registered tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate `args` against the tool's schema: every `required` key must
    /// be present, and declared property types must match.
    pub fn validate(&self, name: &str, args: &serde_json::Value) -> Result<(), String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        let schema = tool.input_schema();

        let obj = args
            .as_object()
            .ok_or_else(|| "arguments must be a JSON object".to_string())?;

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    return Err(format!("missing required argument: {key}"));
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, value) in obj {
                let Some(decl) = props.get(key) else {
                    return Err(format!("unexpected argument: {key}"));
                };
                if let Some(expected) = decl.get("type").and_then(|t| t.as_str()) {
                    if !type_matches(expected, value) {
                        return Err(format!(
                            "argument {key} should be {expected}, got {}",
                            json_type(value)
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "times": {"type": "integer"}
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input["text"].as_str().unwrap_or("").to_string())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        reg
    }

    #[test]
    fn validate_accepts_well_formed_args() {
        let reg = registry();
        assert!(reg
            .validate("echo", &serde_json::json!({"text": "hi", "times": 2}))
            .is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let reg = registry();
        let err = reg.validate("echo", &serde_json::json!({"times": 2})).unwrap_err();
        assert!(err.contains("missing required"));
    }

    #[test]
    fn validate_rejects_wrong_type_and_unknown_keys() {
        let reg = registry();
        assert!(reg
            .validate("echo", &serde_json::json!({"text": 42}))
            .unwrap_err()
            .contains("should be string"));
        assert!(reg
            .validate("echo", &serde_json::json!({"text": "x", "bogus": 1}))
            .unwrap_err()
            .contains("unexpected argument"));
    }

    #[test]
    fn unknown_tool_is_an_error() {
        let reg = registry();
        assert!(reg.validate("nope", &serde_json::json!({})).is_err());
    }

    #[test]
    fn definitions_are_sorted_and_complete() {
        let reg = registry();
        let defs = reg.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert!(defs[0].input_schema["required"][0] == "text");
    }
}

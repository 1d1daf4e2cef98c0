//! Memory tools: let the model store facts and search past memories.

use std::sync::Arc;

use async_trait::async_trait;

use ocg_memory::MemoryStore;

use super::{Tool, ToolResult};

pub struct MemoryStoreTool {
    memory: Arc<MemoryStore>,
}

impl MemoryStoreTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryStoreTool {
    fn name(&self) -> &str {
        "memory_store"
    }

    fn description(&self) -> &str {
        "Save a fact or note to long-term memory so it can be recalled later"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The fact to remember"},
                "tags": {"type": "array", "description": "Optional labels"}
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let content = input["content"].as_str().unwrap_or_default();
        if content.is_empty() {
            return ToolResult::error("content must not be empty");
        }
        let tags: Vec<String> = input["tags"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        match self.memory.store(content, &tags, None).await {
            Ok(id) => ToolResult::success(format!("stored memory {id}")),
            Err(e) => ToolResult::error(format!("memory store failed: {e}")),
        }
    }
}

pub struct MemorySearchTool {
    memory: Arc<MemoryStore>,
    limit: usize,
    min_score: f32,
    alpha: f32,
}

impl MemorySearchTool {
    pub fn new(memory: Arc<MemoryStore>, limit: usize, min_score: f32, alpha: f32) -> Self {
        Self {
            memory,
            limit,
            min_score,
            alpha,
        }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory by meaning and keywords"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "k": {"type": "integer", "description": "Max results"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let query = input["query"].as_str().unwrap_or_default();
        let k = input["k"].as_u64().map(|n| n as usize).unwrap_or(self.limit);

        match self.memory.search(query, k, self.min_score, self.alpha).await {
            Ok(hits) if hits.is_empty() => ToolResult::success("no matching memories"),
            Ok(hits) => {
                let lines: Vec<String> = hits
                    .iter()
                    .map(|h| format!("[{}] (score {:.2}) {}", h.id, h.score, h.content))
                    .collect();
                ToolResult::success(lines.join("\n"))
            }
            Err(e) => ToolResult::error(format!("memory search failed: {e}")),
        }
    }
}

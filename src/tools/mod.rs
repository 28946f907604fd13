//! Agent tools.
//!
//! A [`Tool`] turns JSON arguments from the backend into an operation and
//! returns text for the backend to read. [`ToolRegistry`] owns the tool set
//! handed to the agent loop.

pub mod calendar;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{CalendarError, Result};
use crate::providers::ToolDefinition;
use crate::telemetry::TurnTelemetry;

pub use calendar::CalendarTools;

/// Per-call context passed to every tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Telemetry for the turn the call belongs to.
    pub telemetry: TurnTelemetry,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_telemetry(telemetry: TurnTelemetry) -> Self {
        Self { telemetry }
    }
}

/// What a tool hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Fed back to the backend.
    pub for_llm: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn llm_only(content: impl Into<String>) -> Self {
        Self {
            for_llm: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            for_llm: message.into(),
            is_error: true,
        }
    }
}

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Name-indexed tool set.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for every registered tool, in name order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Run `name` with `args`. Unknown tools are a [`CalendarError::Tool`].
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| CalendarError::Tool(format!("unknown tool '{name}'")))?;
        debug!(tool = name, "Executing tool");
        let started = Instant::now();
        let result = tool.execute(args, ctx).await;
        ctx.telemetry.record_tool_call(name, started.elapsed());
        result
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

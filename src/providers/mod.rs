//! Reasoning backend abstraction.
//!
//! [`LLMProvider`] is the seam between the agent loop and a concrete backend
//! ([`gemini::GeminiProvider`]). [`cached::CachedProvider`] decorates any
//! provider with the fingerprint cache.

pub mod cached;
pub mod gemini;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CostRecord;
use crate::error::{CalendarError, Result};
use crate::session::{Message, ToolCall};
use crate::telemetry::{CacheSavings, TurnTelemetry};

pub use cached::CachedProvider;
pub use gemini::GeminiProvider;

/// A tool the backend may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Unit-of-work telemetry context; cache hits are reported here.
    pub telemetry: Option<TurnTelemetry>,
}

impl ChatOptions {
    pub fn with_telemetry(mut self, telemetry: TurnTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cached_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cached_tokens: 0,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Set the cached counter. The total becomes the sum of all three;
    /// a backend-reported total should be applied afterwards.
    pub fn with_cached(mut self, cached_tokens: u32) -> Self {
        self.cached_tokens = cached_tokens;
        self.total_tokens = self
            .prompt_tokens
            .saturating_add(self.completion_tokens)
            .saturating_add(cached_tokens);
        self
    }
}

/// A backend reply: text, requested tool calls, optional usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LLMResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl LLMResponse {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

impl CostRecord for LLMResponse {
    fn cost(&self) -> Option<CacheSavings> {
        self.usage.map(|u| CacheSavings {
            prompt_tokens: u64::from(u.prompt_tokens),
            completion_tokens: u64::from(u.completion_tokens),
            cached_tokens: u64::from(u.cached_tokens),
            total_tokens: u64::from(u.total_tokens),
        })
    }
}

/// A reasoning backend.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse>;
}

/// Map an HTTP failure from a backend into a [`CalendarError`].
pub fn parse_provider_error(status: u16, message: &str) -> CalendarError {
    let kind = match status {
        400 => "bad request",
        401 | 403 => "authentication failed",
        404 => "model not found",
        429 => "rate limited",
        500..=599 => "server error",
        _ => "unexpected status",
    };
    CalendarError::Provider(format!("{kind} (HTTP {status}): {message}"))
}

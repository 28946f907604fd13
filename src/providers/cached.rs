//! Response-caching decorator for any [`LLMProvider`].
//!
//! The fingerprint covers everything that shapes the backend's answer:
//! provider, model, the full message history, tool schemas and sampling
//! options. A hit skips the backend entirely and reports the original
//! response's token usage as savings. Failed calls are never cached.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{ChatOptions, LLMProvider, LLMResponse, ToolDefinition};
use crate::cache::{fingerprint, ResponseCache};
use crate::error::Result;
use crate::session::Message;
use crate::telemetry::TurnTelemetry;

/// Serialized form of an outbound request, hashed into the cache key.
#[derive(Serialize)]
struct RequestFingerprint<'a> {
    provider: &'a str,
    model: &'a str,
    messages: &'a [Message],
    tools: &'a [ToolDefinition],
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

/// A decorator [`LLMProvider`] that serves repeated requests from a
/// [`ResponseCache`].
pub struct CachedProvider {
    inner: Box<dyn LLMProvider>,
    cache: Arc<ResponseCache<LLMResponse>>,
}

impl CachedProvider {
    pub fn new(inner: Box<dyn LLMProvider>, cache: Arc<ResponseCache<LLMResponse>>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<ResponseCache<LLMResponse>> {
        &self.cache
    }

    fn request_key(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: Option<&str>,
        options: &ChatOptions,
    ) -> Option<String> {
        fingerprint(&RequestFingerprint {
            provider: self.inner.name(),
            model: model.unwrap_or_else(|| self.inner.default_model()),
            messages,
            tools,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
        })
    }
}

impl std::fmt::Debug for CachedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedProvider")
            .field("provider", &self.inner.name())
            .field("entries", &self.cache.len())
            .finish()
    }
}

#[async_trait]
impl LLMProvider for CachedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        let key = self.request_key(&messages, &tools, model, &options);
        let turn = options
            .telemetry
            .clone()
            .unwrap_or_else(TurnTelemetry::disabled);

        if let Some(key) = key.as_deref() {
            if let Some(cached) = self.cache.get(key, &turn) {
                return Ok(cached);
            }
        }

        let response = self.inner.chat(messages, tools, model, options).await?;
        if let Some(key) = key {
            debug!(provider = %self.inner.name(), "Caching backend response");
            self.cache.set(key, response.clone());
        }
        Ok(response)
    }
}

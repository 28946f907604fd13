//! Native Gemini provider with function calling.
//!
//! Auth priority: config key → GEMINI_API_KEY → GOOGLE_API_KEY
//!
//! Thinking model support: Gemini 2.5 models return parts tagged `thought: true`.
//! This provider filters those out and only returns the final non-thought text.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::{CalendarError, Result};
use crate::session::{Message, Role, ToolCall};

use super::{parse_provider_error, ChatOptions, LLMProvider, LLMResponse, ToolDefinition, Usage};

/// Gemini v1beta REST API base.
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model when none is configured or passed at call time.
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

// ── Auth ─────────────────────────────────────────────────────────────────────

/// Authentication method for the Gemini REST API.
pub enum GeminiAuth {
    /// Standard API key, sent as `?key=` query parameter.
    ApiKey(String),
    /// OAuth bearer token, sent as `Authorization: Bearer` header.
    BearerToken(String),
}

impl std::fmt::Debug for GeminiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("GeminiAuth::ApiKey([REDACTED])"),
            Self::BearerToken(_) => f.write_str("GeminiAuth::BearerToken([REDACTED])"),
        }
    }
}

impl GeminiAuth {
    /// Resolve an API key: the configured one first, then the environment.
    pub fn resolve(explicit_key: Option<&str>, env_key: Option<&str>) -> Option<Self> {
        explicit_key
            .filter(|k| !k.is_empty())
            .or_else(|| env_key.filter(|k| !k.is_empty()))
            .map(|k| Self::ApiKey(k.to_string()))
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

/// Gemini provider that speaks the `generateContent` REST API directly.
pub struct GeminiProvider {
    auth: GeminiAuth,
    model: String,
    client: Client,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("auth", &self.auth)
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiProvider {
    /// Build a provider that authenticates with an API key.
    pub fn new_with_key(api_key: &str, model: &str) -> Self {
        Self {
            auth: GeminiAuth::ApiKey(api_key.to_string()),
            model: model.to_string(),
            client: Self::build_client(),
        }
    }

    /// Build a provider that authenticates with a bearer token.
    pub fn new_with_token(bearer_token: &str, model: &str) -> Self {
        Self {
            auth: GeminiAuth::BearerToken(bearer_token.to_string()),
            model: model.to_string(),
            client: Self::build_client(),
        }
    }

    pub fn default_gemini_model() -> &'static str {
        DEFAULT_GEMINI_MODEL
    }

    /// Build from the configured key, falling back to the environment.
    ///
    /// Fails with [`CalendarError::Config`] when no key is available.
    pub fn from_config(api_key: Option<&str>, model: &str) -> Result<Self> {
        let env_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .ok();
        let auth = GeminiAuth::resolve(api_key, env_key.as_deref()).ok_or_else(|| {
            CalendarError::Config("GEMINI_API_KEY or GOOGLE_API_KEY must be set".into())
        })?;
        let model = if model.trim().is_empty() {
            DEFAULT_GEMINI_MODEL
        } else {
            model
        };
        Ok(Self {
            auth,
            model: model.to_string(),
            client: Self::build_client(),
        })
    }

    fn build_client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default()
    }

    /// Convert one conversation message into Gemini `parts`.
    fn message_parts(message: &Message) -> Vec<Value> {
        match message.role {
            Role::Tool => vec![json!({
                "functionResponse": {
                    "name": message.tool_name.as_deref().unwrap_or_default(),
                    "response": { "content": &message.content }
                }
            })],
            Role::Assistant if !message.tool_calls.is_empty() => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(json!({ "text": &message.content }));
                }
                parts.extend(message.tool_calls.iter().map(|call| {
                    json!({ "functionCall": { "name": &call.name, "args": &call.arguments } })
                }));
                parts
            }
            _ => vec![json!({ "text": &message.content })],
        }
    }

    /// Build a full `generateContent` request body.
    ///
    /// Consecutive tool results are merged into one `user` turn, which is
    /// how Gemini expects answers to a multi-call `model` turn.
    fn build_messages_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Value {
        let system_prompt = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str());

        let mut contents: Vec<Value> = Vec::new();
        let mut previous_role: Option<Role> = None;
        for message in messages.iter().filter(|m| m.role != Role::System) {
            let parts = Self::message_parts(message);
            let merge = message.role == Role::Tool && previous_role == Some(Role::Tool);
            match contents.last_mut() {
                Some(last) if merge => {
                    if let Some(existing) = last["parts"].as_array_mut() {
                        existing.extend(parts);
                    }
                }
                _ => {
                    let gemini_role = match message.role {
                        Role::Assistant => "model",
                        _ => "user",
                    };
                    contents.push(json!({ "role": gemini_role, "parts": parts }));
                }
            }
            previous_role = Some(message.role);
        }

        let mut generation_config = json!({});
        if let Some(max_tokens) = options.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        if let Some(temp) = options.temperature {
            generation_config["temperature"] = json!(temp);
        }
        if let Some(top_p) = options.top_p {
            generation_config["topP"] = json!(top_p);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config
        });

        if let Some(sys) = system_prompt {
            body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
        }

        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": &t.name,
                        "description": &t.description,
                        "parameters": &t.parameters
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        body
    }

    /// Extract final answer text from a Gemini API response.
    ///
    /// Parts tagged `"thought": true` are intermediate reasoning and are
    /// skipped unless nothing else is present.
    pub fn extract_text(response: &Value) -> Option<String> {
        let parts = response["candidates"][0]["content"]["parts"].as_array()?;

        let final_parts: Vec<&str> = parts
            .iter()
            .filter(|p| !p["thought"].as_bool().unwrap_or(false))
            .filter_map(|p| p["text"].as_str())
            .collect();

        if !final_parts.is_empty() {
            return Some(final_parts.join(""));
        }

        let thought_parts: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();

        if !thought_parts.is_empty() {
            Some(thought_parts.join(""))
        } else {
            None
        }
    }

    /// Extract requested function calls.
    ///
    /// Gemini does not always return call ids; a positional id is derived
    /// instead so that identical responses stay byte-identical.
    pub fn extract_tool_calls(response: &Value) -> Vec<ToolCall> {
        let Some(parts) = response["candidates"][0]["content"]["parts"].as_array() else {
            return Vec::new();
        };
        parts
            .iter()
            .filter_map(|p| p.get("functionCall"))
            .enumerate()
            .filter_map(|(index, call)| {
                let name = call["name"].as_str()?;
                let id = call["id"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| format!("call-{index}-{name}"));
                let args = match &call["args"] {
                    Value::Null => json!({}),
                    other => other.clone(),
                };
                Some(ToolCall::new(id, name, args))
            })
            .collect()
    }

    /// Parse token usage from a Gemini response if available.
    fn extract_usage(response: &Value) -> Option<Usage> {
        let meta = response.get("usageMetadata")?;
        let prompt = u32::try_from(meta["promptTokenCount"].as_u64()?).ok()?;
        let completion = meta["candidatesTokenCount"]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        let cached = meta["cachedContentTokenCount"]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        let mut usage = Usage::new(prompt, completion).with_cached(cached);
        if let Some(total) = meta["totalTokenCount"]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
        {
            usage.total_tokens = total;
        }
        Some(usage)
    }

    /// Build the full API URL for `generateContent`.
    fn api_url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", GEMINI_API_BASE, model)
    }

    /// Attach authentication to the request builder.
    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            GeminiAuth::ApiKey(key) => request.query(&[("key", key.as_str())]),
            GeminiAuth::BearerToken(token) => {
                request.header("Authorization", format!("Bearer {}", token))
            }
        }
    }
}

#[async_trait]
impl LLMProvider for GeminiProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        let model = model.unwrap_or(&self.model);
        let body = self.build_messages_body(&messages, &tools, &options);

        debug!(model, tools = tools.len(), "Gemini request");

        let request = self
            .client
            .post(self.api_url(model))
            .header("Content-Type", "application/json")
            .json(&body);

        let request = self.apply_auth(request);

        let response = request
            .send()
            .await
            .map_err(|e| CalendarError::Provider(format!("Gemini request failed: {}", e)))?;

        if response.status().is_success() {
            let json: Value = response.json().await.map_err(|e| {
                CalendarError::Provider(format!("Failed to parse Gemini response: {}", e))
            })?;

            let content = Self::extract_text(&json).unwrap_or_default();
            let mut llm_response =
                LLMResponse::text(&content).with_tool_calls(Self::extract_tool_calls(&json));
            if let Some(u) = Self::extract_usage(&json) {
                llm_response = llm_response.with_usage(u);
            }
            return Ok(llm_response);
        }

        let status = response.status().as_u16();
        let error_text = response.text().await.unwrap_or_default();

        let body_msg = serde_json::from_str::<Value>(&error_text)
            .ok()
            .and_then(|v| {
                v["error"]["message"]
                    .as_str()
                    .map(|s| format!("Gemini API error: {}", s))
            })
            .unwrap_or_else(|| format!("Gemini API error: {}", error_text));

        Err(parse_provider_error(status, &body_msg))
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        GeminiProvider::new_with_key("test-key", DEFAULT_GEMINI_MODEL)
    }

    #[test]
    fn test_auth_resolution_prefers_explicit_key() {
        let auth = GeminiAuth::resolve(Some("explicit-key"), Some("env-key"));
        assert!(matches!(auth, Some(GeminiAuth::ApiKey(k)) if k == "explicit-key"));
    }

    #[test]
    fn test_auth_resolution_falls_back_to_env() {
        let auth = GeminiAuth::resolve(Some(""), Some("env-key"));
        assert!(matches!(auth, Some(GeminiAuth::ApiKey(k)) if k == "env-key"));
    }

    #[test]
    fn test_auth_resolution_returns_none_with_no_credentials() {
        assert!(GeminiAuth::resolve(None, None).is_none());
    }

    #[test]
    fn test_auth_debug_redacts_secret() {
        let auth = GeminiAuth::ApiKey("super-secret".into());
        assert!(!format!("{auth:?}").contains("super-secret"));
    }

    #[test]
    fn test_extract_thinking_model_response_skips_thought_parts() {
        let response = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "thinking...", "thought": true },
                        { "text": "Final answer here" }
                    ]
                }
            }]
        });
        let text = GeminiProvider::extract_text(&response);
        assert_eq!(text.as_deref(), Some("Final answer here"));
    }

    #[test]
    fn test_extract_thinking_falls_back_to_thought_if_no_final() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "only thought part", "thought": true }] }
            }]
        });
        let text = GeminiProvider::extract_text(&response);
        assert_eq!(text.as_deref(), Some("only thought part"));
    }

    #[test]
    fn test_extract_text_returns_none_for_empty_parts() {
        let response = json!({ "candidates": [{ "content": { "parts": [] } }] });
        assert!(GeminiProvider::extract_text(&response).is_none());
    }

    #[test]
    fn test_extract_tool_calls() {
        let response = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "functionCall": { "name": "list_events", "args": {
                            "start_iso": "2026-02-10T00:00:00+01:00",
                            "end_iso": "2026-02-11T00:00:00+01:00"
                        } } },
                        { "functionCall": { "name": "delete_events" } }
                    ]
                }
            }]
        });
        let calls = GeminiProvider::extract_tool_calls(&response);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "list_events");
        assert_eq!(calls[0].id, "call-0-list_events");
        assert_eq!(calls[0].arguments["start_iso"], "2026-02-10T00:00:00+01:00");
        assert_eq!(calls[1].arguments, json!({}));
    }

    #[test]
    fn test_extract_tool_calls_is_deterministic() {
        let response = json!({
            "candidates": [{ "content": { "parts": [
                { "functionCall": { "name": "list_events", "args": {} } }
            ] } }]
        });
        assert_eq!(
            GeminiProvider::extract_tool_calls(&response),
            GeminiProvider::extract_tool_calls(&response)
        );
    }

    #[test]
    fn test_extract_usage_parses_token_counts() {
        let response = json!({
            "usageMetadata": {
                "promptTokenCount": 10,
                "candidatesTokenCount": 5,
                "cachedContentTokenCount": 4,
                "totalTokenCount": 18
            }
        });
        let u = GeminiProvider::extract_usage(&response).unwrap();
        assert_eq!(u.prompt_tokens, 10);
        assert_eq!(u.completion_tokens, 5);
        assert_eq!(u.cached_tokens, 4);
        assert_eq!(u.total_tokens, 18);
    }

    #[test]
    fn test_extract_usage_without_total_sums_counts() {
        let response = json!({
            "usageMetadata": { "promptTokenCount": 7, "candidatesTokenCount": 3 }
        });
        let u = GeminiProvider::extract_usage(&response).unwrap();
        assert_eq!(u.total_tokens, 10);

        let response = json!({
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 3,
                "cachedContentTokenCount": 2
            }
        });
        let u = GeminiProvider::extract_usage(&response).unwrap();
        assert_eq!(u.total_tokens, 12);
    }

    #[test]
    fn test_extract_usage_returns_none_when_missing() {
        let response = json!({ "candidates": [] });
        assert!(GeminiProvider::extract_usage(&response).is_none());
    }

    #[test]
    fn test_build_messages_body_filters_system_role() {
        let messages = vec![Message::system("Be helpful"), Message::user("Hello")];
        let body = provider().build_messages_body(&messages, &[], &ChatOptions::default());
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be helpful");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_build_messages_body_declares_tools() {
        let tools = vec![ToolDefinition {
            name: "list_events".into(),
            description: "List events".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let body = provider().build_messages_body(
            &[Message::user("hi")],
            &tools,
            &ChatOptions::default(),
        );
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "list_events");
        assert_eq!(decl["description"], "List events");
    }

    #[test]
    fn test_build_messages_body_function_round_trip() {
        let a = ToolCall::new("a", "list_events", json!({"start_iso": "x"}));
        let b = ToolCall::new("b", "delete_events", json!({"event_ids": [1]}));
        let messages = vec![
            Message::user("clear tomorrow"),
            Message::assistant_with_tools("", vec![a.clone(), b.clone()]),
            Message::tool_result(&a, "[1] Standup"),
            Message::tool_result(&b, "Deleted 1 event(s): [1]"),
        ];
        let body = provider().build_messages_body(&messages, &[], &ChatOptions::default());
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "list_events");
        assert_eq!(contents[1]["parts"][1]["functionCall"]["args"]["event_ids"][0], 1);
        let responses = contents[2]["parts"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["functionResponse"]["name"], "list_events");
        assert_eq!(
            responses[1]["functionResponse"]["response"]["content"],
            "Deleted 1 event(s): [1]"
        );
    }

    #[test]
    fn test_generation_config_from_options() {
        let options = ChatOptions {
            max_tokens: Some(256),
            temperature: Some(0.0),
            ..Default::default()
        };
        let body = provider().build_messages_body(&[Message::user("hi")], &[], &options);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(body["generationConfig"]["temperature"], 0.0);
        assert!(body["generationConfig"].get("topP").is_none());
    }

    #[test]
    fn test_api_url_format() {
        let url = provider().api_url("gemini-2.0-flash");
        assert!(url.contains("generativelanguage.googleapis.com"));
        assert!(url.ends_with("/models/gemini-2.0-flash:generateContent"));
    }

    #[test]
    fn test_from_config_with_explicit_key() {
        let p = GeminiProvider::from_config(Some("cfg-key"), "gemini-2.5-pro").unwrap();
        assert_eq!(p.name(), "gemini");
        assert_eq!(p.default_model(), "gemini-2.5-pro");
        assert!(matches!(p.auth, GeminiAuth::ApiKey(ref k) if k == "cfg-key"));
    }

    #[test]
    fn test_from_config_blank_model_uses_default() {
        let p = GeminiProvider::from_config(Some("cfg-key"), "  ").unwrap();
        assert_eq!(p.default_model(), GeminiProvider::default_gemini_model());
    }

    #[test]
    fn test_new_with_token_uses_bearer() {
        let p = GeminiProvider::new_with_token("tok", "gemini-2.0-flash");
        assert!(matches!(p.auth, GeminiAuth::BearerToken(ref t) if t == "tok"));
    }
}

//! Conversational agent loop.
//!
//! One call to [`CalendarAgent::run_turn`] is one unit of work: it opens a
//! [`TurnTelemetry`], alternates backend calls and tool calls until the
//! backend answers in plain text (or the step budget runs out), and closes
//! the telemetry with a [`TurnSummary`].

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Timelike};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::Message;
use crate::telemetry::{CacheSavings, Telemetry, TurnSummary};
use crate::timeparse::format_timestamp;
use crate::tools::{ToolContext, ToolRegistry};

/// Default number of backend calls per turn.
pub const DEFAULT_MAX_STEPS: usize = 8;

/// Instructions sent with every request.
pub const SYSTEM_PROMPT: &str = "You are a concise Calendar Assistant.\n\
Rules:\n\
1. Never invent event IDs. Only use IDs returned by tools.\n\
2. Use tools for all CRUD operations (list, add, update, delete).\n\
3. If a time range or event ID is missing or ambiguous, ask a concise clarifying question.\n\
4. If the user refers to events by title for update/delete, first call list_events for the \
inferred range to obtain IDs; never guess IDs.\n\
5. Interpret relative dates against the CURRENT_TIME prefix and always pass ISO 8601 \
timestamps with an explicit offset.\n\
6. Be concise in your responses.";

/// Result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final assistant text.
    pub text: String,
    pub summary: TurnSummary,
    /// Backend calls made (cache hits included).
    pub steps: usize,
}

/// Stateful agent: keeps the conversation across turns.
pub struct CalendarAgent {
    provider: Arc<dyn LLMProvider>,
    tools: ToolRegistry,
    telemetry: Arc<Telemetry>,
    history: Mutex<Vec<Message>>,
    model: Option<String>,
    max_steps: usize,
}

impl CalendarAgent {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        tools: ToolRegistry,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            provider,
            tools,
            telemetry,
            history: Mutex::new(Vec::new()),
            model: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Messages exchanged so far (system prompt excluded).
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Forget the conversation.
    pub async fn reset(&self) {
        self.history.lock().await.clear();
    }

    /// Process one user request.
    ///
    /// `now` is sent to the backend at minute precision, so repeating a
    /// request within the same minute produces an identical fingerprint.
    /// On a backend failure the turn's messages are rolled back and the
    /// error is returned.
    pub async fn run_turn(&self, input: &str, now: DateTime<FixedOffset>) -> Result<TurnOutcome> {
        let turn = self.telemetry.begin_turn();
        let ctx = ToolContext::with_telemetry(turn.clone());
        let options = ChatOptions::default().with_telemetry(turn.clone());
        let definitions = self.tools.definitions();

        let mut history = self.history.lock().await;
        let checkpoint = history.len();
        history.push(Message::user(format!(
            "[CURRENT_TIME={}] {}",
            format_timestamp(&truncate_to_minute(now)),
            input.trim()
        )));

        for step in 1..=self.max_steps {
            let mut messages = Vec::with_capacity(history.len() + 1);
            messages.push(Message::system(SYSTEM_PROMPT));
            messages.extend(history.iter().cloned());

            let response = match self
                .provider
                .chat(
                    messages,
                    definitions.clone(),
                    self.model.as_deref(),
                    options.clone(),
                )
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    history.truncate(checkpoint);
                    turn.finish();
                    return Err(e);
                }
            };

            if let Some(usage) = &response.usage {
                turn.record_usage(CacheSavings::new(
                    u64::from(usage.prompt_tokens),
                    u64::from(usage.completion_tokens),
                    u64::from(usage.cached_tokens),
                ));
            }

            if !response.has_tool_calls() {
                history.push(Message::assistant(response.content.clone()));
                let summary = turn.finish();
                info!(steps = step, hits = summary.hits, "Turn complete");
                return Ok(TurnOutcome {
                    text: response.content,
                    summary,
                    steps: step,
                });
            }

            history.push(Message::assistant_with_tools(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                debug!(step, tool = %call.name, "Tool call requested");
                let content = match self
                    .tools
                    .execute(&call.name, call.arguments.clone(), &ctx)
                    .await
                {
                    Ok(output) => output.for_llm,
                    Err(e) => format!("Error: {e}"),
                };
                history.push(Message::tool_result(call, content));
            }
        }

        warn!(max_steps = self.max_steps, "Turn stopped at step limit");
        let text = format!(
            "I could not finish this request within {} steps. Please try rephrasing it.",
            self.max_steps
        );
        history.push(Message::assistant(text.clone()));
        Ok(TurnOutcome {
            text,
            summary: turn.finish(),
            steps: self.max_steps,
        })
    }
}

fn truncate_to_minute(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueryResultCache, ResponseCache};
    use crate::error::CalendarError;
    use crate::providers::{CachedProvider, LLMResponse, ToolDefinition, Usage};
    use crate::session::{Role, ToolCall};
    use crate::store::JsonEventStore;
    use crate::telemetry::test_support::RecordingSink;
    use crate::tools::CalendarTools;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Replays scripted responses and records what it was sent.
    struct ScriptedProvider {
        script: StdMutex<VecDeque<Result<LLMResponse>>>,
        calls: AtomicUsize,
        seen: StdMutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<LLMResponse>>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }

        async fn chat(
            &self,
            messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(LLMResponse::text("done")))
        }
    }

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-02-09T10:15:42+01:00").unwrap()
    }

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(3600).unwrap()
    }

    fn calendar_registry() -> (ToolRegistry, Arc<CalendarTools>) {
        let cache = Arc::new(QueryResultCache::new(16, true, tz()));
        let tools = Arc::new(CalendarTools::new(
            Arc::new(JsonEventStore::new_in_memory()),
            cache,
            false,
            tz(),
        ));
        let mut registry = ToolRegistry::new();
        CalendarTools::register_all(Arc::clone(&tools), &mut registry);
        (registry, tools)
    }

    fn list_call(id: &str) -> ToolCall {
        ToolCall::new(
            id,
            "list_events",
            json!({"start_iso": "2026-02-10T00:00:00+01:00", "end_iso": "2026-02-11T00:00:00+01:00"}),
        )
    }

    #[tokio::test]
    async fn test_plain_answer_single_step() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LLMResponse::text("Hi!"))]));
        let agent = CalendarAgent::new(
            provider.clone(),
            ToolRegistry::new(),
            Arc::new(Telemetry::disabled()),
        );
        let outcome = agent.run_turn("hello", now()).await.unwrap();
        assert_eq!(outcome.text, "Hi!");
        assert_eq!(outcome.steps, 1);

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0][0].role, Role::System);
        assert_eq!(
            seen[0][1].content,
            "[CURRENT_TIME=2026-02-09T10:15:00+01:00] hello"
        );
        assert_eq!(agent.history_len().await, 2);
    }

    #[tokio::test]
    async fn test_tool_round_trip_and_query_cache_hit() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LLMResponse::text("").with_tool_calls(vec![list_call("a")])),
            Ok(LLMResponse::text("").with_tool_calls(vec![list_call("b")])),
            Ok(LLMResponse::text("Nothing tomorrow.")),
        ]));
        let (registry, _) = calendar_registry();
        let sink = Arc::new(RecordingSink::default());
        let agent = CalendarAgent::new(
            provider.clone(),
            registry,
            Arc::new(Telemetry::new(sink.clone(), true)),
        );

        let outcome = agent.run_turn("what's tomorrow?", now()).await.unwrap();
        assert_eq!(outcome.text, "Nothing tomorrow.");
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.summary.tool_calls, 2);
        assert_eq!(outcome.summary.tool_stats["list_events"].count, 2);
        assert_eq!(outcome.summary.hits_by_layer.get("tool"), Some(&1));
        assert_eq!(sink.summaries.lock().unwrap().len(), 1);

        let seen = provider.seen.lock().unwrap();
        let last = seen.last().unwrap();
        let tool_msg = last.iter().rev().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.starts_with("No events found between"));
    }

    #[tokio::test]
    async fn test_client_cache_hit_reports_savings() {
        let inner = ScriptedProvider::new(vec![
            Ok(LLMResponse::text("Hello").with_usage(Usage::new(40, 10))),
        ]);
        let cache = Arc::new(ResponseCache::new(8, true));
        let provider = Arc::new(CachedProvider::new(Box::new(inner), cache));
        let agent = CalendarAgent::new(provider, ToolRegistry::new(), Arc::new(Telemetry::new(
            Arc::new(RecordingSink::default()),
            true,
        )));

        let first = agent.run_turn("hi", now()).await.unwrap();
        assert_eq!(first.summary.hits, 0);
        assert_eq!(first.summary.tokens_used, Some(CacheSavings::new(40, 10, 0)));
        agent.reset().await;
        let second = agent.run_turn("hi", now()).await.unwrap();
        assert_eq!(second.text, "Hello");
        assert_eq!(second.summary.hits_by_layer.get("client"), Some(&1));
        assert_eq!(second.summary.savings.total_tokens, 50);
    }

    #[tokio::test]
    async fn test_tokens_used_sums_every_step() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LLMResponse::text("")
                .with_tool_calls(vec![list_call("a")])
                .with_usage(Usage::new(30, 5))),
            Ok(LLMResponse::text("Free all day.").with_usage(Usage::new(50, 8).with_cached(20))),
        ]));
        let (registry, _) = calendar_registry();
        let agent = CalendarAgent::new(provider, registry, Arc::new(Telemetry::disabled()));

        let outcome = agent.run_turn("tomorrow?", now()).await.unwrap();
        assert_eq!(outcome.summary.tokens_used, Some(CacheSavings::new(80, 13, 20)));
        let text = outcome.summary.render().unwrap();
        assert!(text.contains("Tokens Used: 80 prompt, 13 completion, 20 cached, 113 total"));
        assert!(text.contains("list_events"));
    }

    #[tokio::test]
    async fn test_backend_failure_rolls_back_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LLMResponse::text("first")),
            Err(CalendarError::Provider("rate limited".into())),
        ]));
        let agent = CalendarAgent::new(provider, ToolRegistry::new(), Arc::new(Telemetry::disabled()));
        agent.run_turn("one", now()).await.unwrap();
        let err = agent.run_turn("two", now()).await.unwrap_err();
        assert!(matches!(err, CalendarError::Provider(_)));
        assert_eq!(agent.history_len().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LLMResponse::text("").with_tool_calls(vec![ToolCall::new("x", "teleport", json!({}))])),
            Ok(LLMResponse::text("Sorry.")),
        ]));
        let agent = CalendarAgent::new(provider.clone(), ToolRegistry::new(), Arc::new(Telemetry::disabled()));
        let outcome = agent.run_turn("beam me up", now()).await.unwrap();
        assert_eq!(outcome.text, "Sorry.");
        let seen = provider.seen.lock().unwrap();
        let tool_msg = seen[1].iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.contains("unknown tool 'teleport'"));
    }

    #[tokio::test]
    async fn test_step_limit() {
        let looping: Vec<Result<LLMResponse>> = (0..5)
            .map(|i| Ok(LLMResponse::text("").with_tool_calls(vec![list_call(&format!("c{i}"))])))
            .collect();
        let provider = Arc::new(ScriptedProvider::new(looping));
        let (registry, _) = calendar_registry();
        let agent = CalendarAgent::new(provider.clone(), registry, Arc::new(Telemetry::disabled()))
            .with_max_steps(3);
        let outcome = agent.run_turn("loop", now()).await.unwrap();
        assert_eq!(outcome.steps, 3);
        assert!(outcome.text.contains("3 steps"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_truncate_to_minute() {
        let t = truncate_to_minute(now());
        assert_eq!(format_timestamp(&t), "2026-02-09T10:15:00+01:00");
    }
}

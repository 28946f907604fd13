//! Process wiring.
//!
//! [`App`] owns the single instance of each cache tier and the telemetry
//! hub and injects them into the call sites: the response cache into
//! [`CachedProvider`], the query cache into [`CalendarTools`].

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{info, warn};

use crate::agent::{CalendarAgent, TurnOutcome};
use crate::cache::{CacheStats, QueryResultCache, ResponseCache};
use crate::config::Config;
use crate::error::{CalendarError, Result};
use crate::providers::{CachedProvider, GeminiProvider, LLMProvider, LLMResponse};
use crate::store::JsonEventStore;
use crate::telemetry::{Telemetry, TracingSink, TurnTelemetry};
use crate::timeparse::{resolve_event_start_end, resolve_range};
use crate::tools::{CalendarTools, ToolRegistry};

/// Cache counters for both tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct AppStats {
    pub client: CacheStats,
    pub tool: CacheStats,
    pub revision: u64,
}

impl AppStats {
    pub fn render(&self) -> String {
        let line = |name: &str, s: &CacheStats| {
            format!(
                "{name:<7} enabled={} entries={}/{} hits={} misses={} evictions={} hit_rate={:.0}%",
                s.enabled,
                s.entries,
                s.capacity,
                s.hits,
                s.misses,
                s.evictions,
                s.hit_rate() * 100.0
            )
        };
        format!(
            "{}\n{}\nrevision={}",
            line("client", &self.client),
            line("tool", &self.tool),
            self.revision
        )
    }
}

/// The assembled assistant.
pub struct App {
    config: Mutex<Config>,
    tz: FixedOffset,
    /// `None` when built without a backend; listing still works.
    agent: Option<CalendarAgent>,
    calendar: Arc<CalendarTools>,
    store: Arc<JsonEventStore>,
    response_cache: Arc<ResponseCache<LLMResponse>>,
    query_cache: Arc<QueryResultCache>,
    telemetry: Arc<Telemetry>,
}

impl App {
    /// Build with the Gemini backend and the configured event file, loading
    /// (and optionally seeding) the store.
    pub async fn from_config(config: Config) -> Result<Self> {
        let provider = GeminiProvider::from_config(config.api_key.as_deref(), &config.model)?;
        Self::open(config, Some(Box::new(provider))).await
    }

    /// Build over the configured event file with no backend. Event listing
    /// works; conversational turns fail with [`CalendarError::Config`].
    pub async fn without_backend(config: Config) -> Result<Self> {
        Self::open(config, None).await
    }

    async fn open(config: Config, backend: Option<Box<dyn LLMProvider>>) -> Result<Self> {
        let store = Arc::new(JsonEventStore::new(config.db_path()));
        store.load().await?;
        let app = Self::with_parts(config, backend, store);
        app.seed().await?;
        Ok(app)
    }

    /// Build around an optional backend and a store.
    pub fn with_parts(
        config: Config,
        backend: Option<Box<dyn LLMProvider>>,
        store: Arc<JsonEventStore>,
    ) -> Self {
        let tz = config.timezone();
        let telemetry = Arc::new(Telemetry::new(
            Arc::new(TracingSink),
            config.telemetry.enabled,
        ));
        let response_cache = Arc::new(ResponseCache::from_config(&config.cache));
        let query_cache = Arc::new(QueryResultCache::from_config(&config.cache, tz));

        let calendar = Arc::new(CalendarTools::new(
            store.clone(),
            Arc::clone(&query_cache),
            config.structured_output,
            tz,
        ));
        let mut registry = ToolRegistry::new();
        CalendarTools::register_all(Arc::clone(&calendar), &mut registry);

        let agent = backend.map(|backend| {
            let provider: Arc<dyn LLMProvider> =
                Arc::new(CachedProvider::new(backend, Arc::clone(&response_cache)));
            CalendarAgent::new(provider, registry, Arc::clone(&telemetry))
                .with_model(config.model.clone())
                .with_max_steps(config.agent.max_steps)
        });

        Self {
            config: Mutex::new(config),
            tz,
            agent,
            calendar,
            store,
            response_cache,
            query_cache,
            telemetry,
        }
    }

    async fn seed(&self) -> Result<()> {
        if self.config().seed_demo_events {
            self.store.seed_if_empty(self.now()).await?;
        }
        Ok(())
    }

    /// Snapshot of the running configuration.
    pub fn config(&self) -> Config {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current time in the configured offset.
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.tz)
    }

    /// The conversational agent, or a config error when there is no backend.
    pub fn agent(&self) -> Result<&CalendarAgent> {
        self.agent.as_ref().ok_or_else(|| {
            CalendarError::Config("no reasoning backend configured (set GEMINI_API_KEY)".into())
        })
    }

    pub fn calendar(&self) -> &Arc<CalendarTools> {
        &self.calendar
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Run one conversational turn at the current time.
    pub async fn run_turn(&self, input: &str) -> Result<TurnOutcome> {
        self.agent()?.run_turn(input, self.now()).await
    }

    /// List events for a phrase such as "tomorrow afternoon", bypassing the
    /// backend.
    pub async fn list_phrase(&self, phrase: &str) -> Result<String> {
        let (start, end) = resolve_range(phrase, self.now()).ok_or_else(|| {
            CalendarError::InvalidInput(format!("could not resolve a time range from '{phrase}'"))
        })?;
        self.calendar
            .list_events(&start, &end, &TurnTelemetry::disabled())
            .await
    }

    /// Add an event whose time is given as a phrase such as "tomorrow at 10"
    /// or "friday from 9 to 11:30", bypassing the backend.
    pub async fn add_phrase(&self, title: &str, when: &str) -> Result<String> {
        let (start, end) = resolve_event_start_end(when, self.now()).ok_or_else(|| {
            CalendarError::InvalidInput(format!("could not resolve an event time from '{when}'"))
        })?;
        self.calendar
            .add_event(title, &start, &end, None, None)
            .await
    }

    pub fn stats(&self) -> AppStats {
        AppStats {
            client: self.response_cache.stats(),
            tool: self.query_cache.stats(),
            revision: self.query_cache.revision(),
        }
    }

    /// Apply a reloaded configuration.
    ///
    /// Cache and telemetry switches take effect immediately. Other changes
    /// (capacities, model, paths, offset) are logged and need a restart.
    /// Returns the names of the switches that changed.
    pub fn apply_reload(&self, next: &Config) -> Vec<&'static str> {
        let mut current = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        let mut applied = Vec::new();

        if current.cache.client_enabled != next.cache.client_enabled {
            self.response_cache.set_enabled(next.cache.client_enabled);
            current.cache.client_enabled = next.cache.client_enabled;
            applied.push("cache.client_enabled");
        }
        if current.cache.tool_enabled != next.cache.tool_enabled {
            self.query_cache.set_enabled(next.cache.tool_enabled);
            current.cache.tool_enabled = next.cache.tool_enabled;
            applied.push("cache.tool_enabled");
        }
        if current.telemetry.enabled != next.telemetry.enabled {
            self.telemetry.set_enabled(next.telemetry.enabled);
            current.telemetry.enabled = next.telemetry.enabled;
            applied.push("telemetry.enabled");
        }

        let mut restart_needed = current.clone();
        restart_needed.cache.client_enabled = next.cache.client_enabled;
        restart_needed.cache.tool_enabled = next.cache.tool_enabled;
        restart_needed.telemetry.enabled = next.telemetry.enabled;
        if &restart_needed != next {
            warn!("Config changes beyond cache/telemetry switches need a restart");
        }
        if !applied.is_empty() {
            info!(?applied, "Applied config reload");
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatOptions, ToolDefinition};
    use crate::session::Message;
    use async_trait::async_trait;

    struct StaticProvider;

    #[async_trait]
    impl LLMProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }

        fn default_model(&self) -> &str {
            "static-model"
        }

        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            Ok(LLMResponse::text("ok"))
        }
    }

    fn app(config: Config) -> App {
        App::with_parts(
            config,
            Some(Box::new(StaticProvider)),
            Arc::new(JsonEventStore::new_in_memory()),
        )
    }

    #[tokio::test]
    async fn test_turn_populates_client_cache() {
        let app = app(Config::default());
        app.run_turn("hello").await.unwrap();
        let stats = app.stats();
        assert_eq!(stats.client.entries, 1);
        assert_eq!(stats.client.misses, 1);
        assert_eq!(stats.revision, 0);
    }

    #[tokio::test]
    async fn test_tiers_disable_independently() {
        let mut config = Config::default();
        config.cache.client_enabled = false;
        let app = app(config);
        assert!(!app.stats().client.enabled);
        assert!(app.stats().tool.enabled);

        app.run_turn("hello").await.unwrap();
        assert_eq!(app.stats().client.entries, 0);
    }

    #[tokio::test]
    async fn test_list_phrase_uses_query_cache() {
        let app = app(Config::default());
        app.list_phrase("tomorrow").await.unwrap();
        app.list_phrase("tomorrow").await.unwrap();
        let stats = app.stats();
        assert_eq!(stats.tool.hits, 1);
        assert_eq!(stats.tool.misses, 1);

        let err = app.list_phrase("whenever").await.unwrap_err();
        assert!(matches!(err, CalendarError::InvalidInput(_)));
    }

    #[test]
    fn test_apply_reload_toggles_switches() {
        let app = app(Config::default());
        let mut next = Config::default();
        next.cache.tool_enabled = false;
        next.telemetry.enabled = true;

        let applied = app.apply_reload(&next);
        assert_eq!(applied, vec!["cache.tool_enabled", "telemetry.enabled"]);
        assert!(!app.stats().tool.enabled);
        assert!(app.telemetry().is_enabled());
        assert!(app.apply_reload(&next).is_empty());
    }

    #[test]
    fn test_apply_reload_ignores_restart_only_fields() {
        let app = app(Config::default());
        let mut next = Config::default();
        next.cache.client_max_entries = 4;
        assert!(app.apply_reload(&next).is_empty());
        assert_eq!(app.stats().client.capacity, 128);
    }

    #[test]
    fn test_stats_render() {
        let rendered = app(Config::default()).stats().render();
        assert!(rendered.contains("client  enabled=true entries=0/128"));
        assert!(rendered.ends_with("revision=0"));
    }

    #[tokio::test]
    async fn test_from_config_seeds_file_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            api_key: Some("test-key".into()),
            db_path: Some(dir.path().join("events.json")),
            ..Config::default()
        };
        let app = App::from_config(config).await.unwrap();
        assert!(app.store.len().await > 0);
        assert!(dir.path().join("events.json").exists());
    }

    #[tokio::test]
    async fn test_listing_works_without_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            api_key: None,
            db_path: Some(dir.path().join("events.json")),
            ..Config::default()
        };
        let app = App::without_backend(config).await.unwrap();

        let listed = app.list_phrase("tomorrow").await.unwrap();
        assert!(listed.contains("Team standup"));
        app.list_phrase("tomorrow").await.unwrap();
        assert_eq!(app.stats().tool.hits, 1);

        let err = app.run_turn("hello").await.unwrap_err();
        assert!(matches!(err, CalendarError::Config(_)));
        assert!(app.agent().is_err());
    }

    #[tokio::test]
    async fn test_add_phrase_invalidates_listing() {
        let app = app(Config::default());
        assert!(app.list_phrase("day after tomorrow").await.unwrap().starts_with("No events"));

        let added = app
            .add_phrase("Gym", "day after tomorrow from 18 to 19")
            .await
            .unwrap();
        assert_eq!(added, "Event added (ID: 1).");
        assert_eq!(app.stats().revision, 1);
        assert!(app.list_phrase("day after tomorrow").await.unwrap().contains("Gym"));

        let err = app.add_phrase("Gym", "sometime").await.unwrap_err();
        assert!(matches!(err, CalendarError::InvalidInput(_)));
        assert_eq!(app.stats().revision, 1);
    }
}

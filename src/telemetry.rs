//! Cache-hit telemetry and per-turn savings accounting.
//!
//! A [`Telemetry`] hub is created once per process and hands out a fresh
//! [`TurnTelemetry`] for every unit of work (one user turn). Cache call sites
//! receive that context explicitly and report hits through
//! [`TurnTelemetry::record_hit`]; the hub forwards events to a
//! [`TelemetrySink`]. Sink failures are logged and swallowed, so telemetry can
//! never fail the operation that produced it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

/// Layer tag for the backend response cache.
pub const LAYER_CLIENT: &str = "client";

/// Layer tag for the event query cache.
pub const LAYER_TOOL: &str = "tool";

/// Token counts a cache hit avoided spending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSavings {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub total_tokens: u64,
}

impl CacheSavings {
    /// Build from the three counters; the total is their sum.
    pub fn new(prompt_tokens: u64, completion_tokens: u64, cached_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cached_tokens,
            total_tokens: prompt_tokens
                .saturating_add(completion_tokens)
                .saturating_add(cached_tokens),
        }
    }

    pub fn add(&mut self, other: &CacheSavings) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// A single cache-hit event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEvent {
    pub layer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savings: Option<CacheSavings>,
}

/// Calls and accumulated wall time for one tool within a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub count: u64,
    pub total_ms: f64,
}

/// Aggregate of everything recorded during one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnSummary {
    pub hits: u64,
    pub hits_by_layer: BTreeMap<String, u64>,
    pub savings: CacheSavings,
    /// Backend usage summed over every response of the turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<CacheSavings>,
    pub tool_calls: u64,
    pub tool_stats: BTreeMap<String, ToolStats>,
    pub duration_ms: u64,
}

impl TurnSummary {
    /// Human-readable summary block for the REPL, `None` when the turn
    /// produced nothing worth showing.
    pub fn render(&self) -> Option<String> {
        let mut lines = Vec::new();
        if let Some(used) = &self.tokens_used {
            let total = used
                .prompt_tokens
                .saturating_add(used.completion_tokens)
                .saturating_add(used.cached_tokens);
            lines.push(format!(
                "Tokens Used: {} prompt, {} completion, {} cached, {} total",
                used.prompt_tokens, used.completion_tokens, used.cached_tokens, total
            ));
        }
        if self.hits > 0 {
            let layers: Vec<String> = self
                .hits_by_layer
                .iter()
                .map(|(layer, n)| format!("{layer}={n}"))
                .collect();
            lines.push(format!(
                "Cache Hits: {} ({})",
                self.hits,
                layers.join(", ")
            ));
        }
        if self.savings.total_tokens > 0 {
            lines.push(format!(
                "Tokens Saved (Cache): {} prompt, {} completion, {} cached, {} total",
                self.savings.prompt_tokens,
                self.savings.completion_tokens,
                self.savings.cached_tokens,
                self.savings.total_tokens
            ));
        }
        if !self.tool_stats.is_empty() {
            lines.push("Tool Timing:".to_string());
            lines.push(format!("  {:<16} {:>5} {:>10}", "Tool", "Calls", "Total ms"));
            for (name, stats) in &self.tool_stats {
                lines.push(format!(
                    "  {:<16} {:>5} {:>10.2}",
                    name, stats.count, stats.total_ms
                ));
            }
        }
        if lines.is_empty() {
            return None;
        }
        lines.insert(0, format!("Turn Duration: {} ms", self.duration_ms));
        Some(lines.join("\n"))
    }
}

/// Destination for telemetry events (an observability collector).
pub trait TelemetrySink: Send + Sync {
    /// Record one cache hit.
    fn emit(&self, event: &CacheEvent) -> Result<()>;

    /// Record the end of a unit of work.
    fn turn_finished(&self, _summary: &TurnSummary) -> Result<()> {
        Ok(())
    }
}

/// Sink that turns events into structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &CacheEvent) -> Result<()> {
        let savings = event.savings.unwrap_or_default();
        info!(
            event = "cache_hit",
            layer = %event.layer,
            saved_prompt_tokens = savings.prompt_tokens,
            saved_completion_tokens = savings.completion_tokens,
            saved_cached_tokens = savings.cached_tokens,
            saved_total_tokens = savings.total_tokens,
            "Cache hit"
        );
        Ok(())
    }

    fn turn_finished(&self, summary: &TurnSummary) -> Result<()> {
        info!(
            event = "turn_summary",
            hits = summary.hits,
            tool_calls = summary.tool_calls,
            used_total_tokens = summary.tokens_used.map_or(0, |u| u.total_tokens),
            duration_ms = summary.duration_ms,
            saved_total_tokens = summary.savings.total_tokens,
            "Turn telemetry"
        );
        Ok(())
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn emit(&self, _event: &CacheEvent) -> Result<()> {
        Ok(())
    }
}

/// Process-wide telemetry hub with a runtime on/off switch.
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    enabled: AtomicBool,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>, enabled: bool) -> Self {
        Self {
            sink,
            enabled: AtomicBool::new(enabled),
        }
    }

    /// A hub that never emits.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopSink), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Start a unit of work. Savings start at zero; the enabled flag is
    /// sampled once so a turn is either fully reported or not at all.
    pub fn begin_turn(&self) -> TurnTelemetry {
        TurnTelemetry {
            inner: Arc::new(TurnState {
                sink: Arc::clone(&self.sink),
                enabled: self.is_enabled(),
                started: Instant::now(),
                summary: Mutex::new(TurnSummary::default()),
            }),
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

struct TurnState {
    sink: Arc<dyn TelemetrySink>,
    enabled: bool,
    started: Instant,
    summary: Mutex<TurnSummary>,
}

/// Telemetry context for one unit of work. Clone is cheap and shares state.
#[derive(Clone)]
pub struct TurnTelemetry {
    inner: Arc<TurnState>,
}

impl TurnTelemetry {
    /// A context that records nothing (tests, callers outside a turn).
    pub fn disabled() -> Self {
        Telemetry::disabled().begin_turn()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Record a cache hit on `layer`, adding `savings` to this turn's total.
    pub fn record_hit(&self, layer: &str, savings: Option<CacheSavings>) {
        if !self.inner.enabled {
            return;
        }
        {
            let mut summary = self.lock();
            summary.hits += 1;
            *summary.hits_by_layer.entry(layer.to_string()).or_insert(0) += 1;
            if let Some(s) = &savings {
                summary.savings.add(s);
            }
        }
        let event = CacheEvent {
            layer: layer.to_string(),
            savings,
        };
        if let Err(e) = self.inner.sink.emit(&event) {
            warn!(layer = %layer, error = %e, "Telemetry sink rejected cache event");
        }
    }

    /// Count a tool invocation and its wall time for the turn summary.
    pub fn record_tool_call(&self, name: &str, elapsed: Duration) {
        let mut summary = self.lock();
        summary.tool_calls += 1;
        let stats = summary.tool_stats.entry(name.to_string()).or_default();
        stats.count += 1;
        stats.total_ms += elapsed.as_secs_f64() * 1000.0;
    }

    /// Add one backend response's token usage to the turn total.
    pub fn record_usage(&self, usage: CacheSavings) {
        self.lock()
            .tokens_used
            .get_or_insert_with(CacheSavings::default)
            .add(&usage);
    }

    pub fn hits(&self) -> u64 {
        self.lock().hits
    }

    pub fn savings(&self) -> CacheSavings {
        self.lock().savings
    }

    /// Close the unit of work and forward its summary to the sink.
    pub fn finish(&self) -> TurnSummary {
        let summary = {
            let mut summary = self.lock();
            summary.duration_ms =
                u64::try_from(self.inner.started.elapsed().as_millis()).unwrap_or(u64::MAX);
            summary.clone()
        };
        if self.inner.enabled {
            if let Err(e) = self.inner.sink.turn_finished(&summary) {
                warn!(error = %e, "Telemetry sink rejected turn summary");
            }
        }
        summary
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TurnSummary> {
        self.inner
            .summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TurnTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for TurnTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnTelemetry")
            .field("enabled", &self.inner.enabled)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_savings_total_is_sum() {
        let s = CacheSavings::new(10, 5, 2);
        assert_eq!(s.total_tokens, 17);
    }

    #[test]
    fn test_record_hit_accumulates_savings() {
        let (turn, sink) = recording_turn();
        turn.record_hit(LAYER_CLIENT, Some(CacheSavings::new(10, 5, 0)));
        turn.record_hit(LAYER_CLIENT, Some(CacheSavings::new(1, 1, 1)));
        turn.record_hit(LAYER_TOOL, None);

        assert_eq!(turn.hits(), 3);
        assert_eq!(turn.savings(), CacheSavings::new(11, 6, 1));
        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].layer, "tool");
        assert!(events[2].savings.is_none());
    }

    #[test]
    fn test_each_turn_starts_from_zero() {
        let hub = Telemetry::new(Arc::new(RecordingSink::default()), true);
        let first = hub.begin_turn();
        first.record_hit(LAYER_CLIENT, Some(CacheSavings::new(4, 4, 0)));
        first.finish();

        let second = hub.begin_turn();
        assert_eq!(second.hits(), 0);
        assert!(second.savings().is_zero());
    }

    #[test]
    fn test_disabled_hub_emits_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let hub = Telemetry::new(sink.clone(), false);
        let turn = hub.begin_turn();
        turn.record_hit(LAYER_CLIENT, Some(CacheSavings::new(1, 1, 1)));
        let summary = turn.finish();
        assert_eq!(summary.hits, 0);
        assert!(sink.events().is_empty());
        assert!(sink.summaries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_toggle_applies_to_next_turn() {
        let sink = Arc::new(RecordingSink::default());
        let hub = Telemetry::new(sink.clone(), false);
        hub.set_enabled(true);
        hub.begin_turn().record_hit(LAYER_TOOL, None);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_failing_sink_is_swallowed() {
        let hub = Telemetry::new(Arc::new(FailingSink), true);
        let turn = hub.begin_turn();
        turn.record_hit(LAYER_CLIENT, Some(CacheSavings::new(3, 0, 0)));
        let summary = turn.finish();
        assert_eq!(summary.hits, 1);
        assert_eq!(summary.savings.total_tokens, 3);
    }

    #[test]
    fn test_finish_forwards_summary() {
        let (turn, sink) = recording_turn();
        turn.record_tool_call("list_events", Duration::from_millis(2));
        turn.record_hit(LAYER_TOOL, None);
        let summary = turn.finish();
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(summary.hits_by_layer.get("tool"), Some(&1));
        assert_eq!(sink.summaries.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_render_skips_empty_turns() {
        assert!(TurnSummary::default().render().is_none());
        let summary = TurnSummary {
            hits: 1,
            hits_by_layer: BTreeMap::from([("client".to_string(), 1)]),
            savings: CacheSavings::new(10, 2, 0),
            duration_ms: 5,
            ..TurnSummary::default()
        };
        let text = summary.render().unwrap();
        assert!(text.contains("Cache Hits: 1 (client=1)"));
        assert!(text.contains("12 total"));
        assert!(!text.contains("Tokens Used"));
        assert!(!text.contains("Tool Timing"));
    }

    #[test]
    fn test_tool_timing_accumulates_per_tool() {
        let (turn, _) = recording_turn();
        turn.record_tool_call("list_events", Duration::from_millis(3));
        turn.record_tool_call("list_events", Duration::from_millis(2));
        turn.record_tool_call("add_event", Duration::from_millis(1));
        let summary = turn.finish();

        assert_eq!(summary.tool_calls, 3);
        let list = summary.tool_stats["list_events"];
        assert_eq!(list.count, 2);
        assert!((list.total_ms - 5.0).abs() < 1e-6);
        assert_eq!(summary.tool_stats["add_event"].count, 1);

        let text = summary.render().unwrap();
        assert!(text.contains("Tool Timing:"));
        assert!(text.contains("list_events"));
        assert!(text.contains("5.00"));
    }

    #[test]
    fn test_tokens_used_sums_responses() {
        let (turn, _) = recording_turn();
        assert!(turn.finish().tokens_used.is_none());

        turn.record_usage(CacheSavings::new(40, 10, 0));
        turn.record_usage(CacheSavings::new(60, 5, 4));
        let summary = turn.finish();
        assert_eq!(summary.tokens_used, Some(CacheSavings::new(100, 15, 4)));

        let text = summary.render().unwrap();
        assert!(text.contains("Tokens Used: 100 prompt, 15 completion, 4 cached, 119 total"));
    }
}

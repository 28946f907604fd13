//! Calendar tools: list, add, update and delete events.
//!
//! [`CalendarTools`] is the cache-aware front of the event store. Listing
//! goes through the [`QueryResultCache`]; every mutation that the store
//! commits calls [`QueryResultCache::invalidate`] exactly once afterwards.
//! Rejected mutations never touch the cache.
//!
//! # Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use calendar_assistant::cache::QueryResultCache;
//! use calendar_assistant::store::JsonEventStore;
//! use calendar_assistant::telemetry::TurnTelemetry;
//! use calendar_assistant::tools::CalendarTools;
//! use chrono::FixedOffset;
//!
//! let tz = FixedOffset::east_opt(3600).unwrap();
//! let cache = Arc::new(QueryResultCache::new(16, true, tz));
//! let tools = CalendarTools::new(Arc::new(JsonEventStore::new_in_memory()), cache, false, tz);
//! let turn = TurnTelemetry::disabled();
//!
//! let out = tools
//!     .add_event("Standup", "2026-02-10T09:30:00", "2026-02-10T10:00:00", None, None)
//!     .await
//!     .unwrap();
//! assert_eq!(out, "Event added (ID: 1).");
//! let listed = tools
//!     .list_events("2026-02-10", "2026-02-11", &turn)
//!     .await
//!     .unwrap();
//! assert!(listed.starts_with("[1] Standup | Tue Feb 10 09:30-10:00"));
//! # });
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::{json, Value};

use crate::cache::{QueryLookup, QueryResultCache};
use crate::error::{CalendarError, Result};
use crate::store::{CalendarEvent, EventPatch, EventStore, NewEvent};
use crate::telemetry::TurnTelemetry;
use crate::timeparse::{format_timestamp, parse_timestamp};

use super::{Tool, ToolContext, ToolOutput, ToolRegistry};

/// Optional fields for [`CalendarTools::update_event`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventUpdate {
    pub title: Option<String>,
    pub start_iso: Option<String>,
    pub end_iso: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

/// Event operations with query caching and revision invalidation.
pub struct CalendarTools {
    store: Arc<dyn EventStore>,
    cache: Arc<QueryResultCache>,
    structured: bool,
    tz: FixedOffset,
}

impl CalendarTools {
    pub fn new(
        store: Arc<dyn EventStore>,
        cache: Arc<QueryResultCache>,
        structured: bool,
        tz: FixedOffset,
    ) -> Self {
        Self {
            store,
            cache,
            structured,
            tz,
        }
    }

    pub fn cache(&self) -> &Arc<QueryResultCache> {
        &self.cache
    }

    fn parse(&self, field: &str, raw: &str) -> Result<DateTime<FixedOffset>> {
        parse_timestamp(raw, self.tz).ok_or_else(|| {
            CalendarError::InvalidInput(format!("{field} is not an ISO 8601 timestamp: '{raw}'"))
        })
    }

    /// Events overlapping `[start_iso, end_iso)`.
    ///
    /// Served from the query cache when the same normalized range was
    /// listed at the current revision. Store failures propagate and are not
    /// cached.
    pub async fn list_events(
        &self,
        start_iso: &str,
        end_iso: &str,
        turn: &TurnTelemetry,
    ) -> Result<String> {
        let start = self.parse("start_iso", start_iso)?;
        let end = self.parse("end_iso", end_iso)?;
        let (start_key, end_key) = (format_timestamp(&start), format_timestamp(&end));

        let key = match self.cache.begin(&start_key, &end_key, turn) {
            QueryLookup::Hit(rendered) => return Ok(rendered),
            QueryLookup::Miss(key) => key,
        };

        let events = self.store.query(start, end).await?;
        let rendered = self.render_list(&events, &start_key, &end_key)?;
        self.cache.complete(key, rendered.clone());
        Ok(rendered)
    }

    pub async fn add_event(
        &self,
        title: &str,
        start_iso: &str,
        end_iso: &str,
        location: Option<&str>,
        notes: Option<&str>,
    ) -> Result<String> {
        let mut event = NewEvent::new(
            title,
            self.parse("start_iso", start_iso)?,
            self.parse("end_iso", end_iso)?,
        );
        event.location = location.map(String::from);
        event.notes = notes.map(String::from);

        let created = self.store.add(event).await?;
        self.cache.invalidate();

        if self.structured {
            Ok(json!({ "created_id": created.id }).to_string())
        } else {
            Ok(format!("Event added (ID: {}).", created.id))
        }
    }

    pub async fn update_event(&self, event_id: i64, update: EventUpdate) -> Result<String> {
        let patch = EventPatch {
            title: update.title,
            start: update
                .start_iso
                .as_deref()
                .map(|raw| self.parse("start_iso", raw))
                .transpose()?,
            end: update
                .end_iso
                .as_deref()
                .map(|raw| self.parse("end_iso", raw))
                .transpose()?,
            location: update.location,
            notes: update.notes,
        };
        if patch.is_empty() {
            return Err(CalendarError::InvalidInput(
                "update_event needs at least one field to change".into(),
            ));
        }

        let updated = self.store.update(event_id, patch).await?;
        self.cache.invalidate();

        if self.structured {
            Ok(json!({ "updated_id": updated.id }).to_string())
        } else {
            Ok(format!("Event {} updated successfully.", updated.id))
        }
    }

    /// Delete events by id. Deleting nothing is a [`CalendarError::NotFound`].
    pub async fn delete_events(&self, event_ids: &[i64]) -> Result<String> {
        if event_ids.is_empty() {
            return Err(CalendarError::InvalidInput(
                "event_ids must not be empty".into(),
            ));
        }
        let deleted = self.store.delete(event_ids).await?;
        if deleted.is_empty() {
            return Err(CalendarError::NotFound(format!(
                "no events with ids {event_ids:?}"
            )));
        }
        self.cache.invalidate();

        if self.structured {
            Ok(json!({ "deleted_ids": deleted, "deleted_count": deleted.len() }).to_string())
        } else {
            Ok(format!("Deleted {} event(s): {:?}", deleted.len(), deleted))
        }
    }

    fn render_list(&self, events: &[CalendarEvent], start: &str, end: &str) -> Result<String> {
        if self.structured {
            let events: Vec<Value> = events.iter().map(|e| self.event_json(e)).collect();
            return Ok(serde_json::to_string(
                &json!({ "events": events, "start": start, "end": end }),
            )?);
        }
        if events.is_empty() {
            return Ok(format!("No events found between {start} and {end}."));
        }
        Ok(events
            .iter()
            .map(|e| self.event_line(e))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// `[id] title | Tue Feb 10 10:00-11:00 @ location (notes)`
    fn event_line(&self, event: &CalendarEvent) -> String {
        let start = event.start.with_timezone(&self.tz);
        let end = event.end.with_timezone(&self.tz);
        let end_fmt = if start.date_naive() == end.date_naive() {
            "%H:%M"
        } else {
            "%a %b %-d %H:%M"
        };
        let mut line = format!(
            "[{}] {} | {}-{}",
            event.id,
            event.title,
            start.format("%a %b %-d %H:%M"),
            end.format(end_fmt)
        );
        if let Some(location) = &event.location {
            line.push_str(&format!(" @ {location}"));
        }
        if let Some(notes) = &event.notes {
            line.push_str(&format!(" ({notes})"));
        }
        line
    }

    fn event_json(&self, event: &CalendarEvent) -> Value {
        json!({
            "id": event.id,
            "title": event.title,
            "start": format_timestamp(&event.start.with_timezone(&self.tz)),
            "end": format_timestamp(&event.end.with_timezone(&self.tz)),
            "location": event.location,
            "notes": event.notes,
        })
    }

    /// Register the four agent tools backed by `tools`.
    pub fn register_all(tools: Arc<Self>, registry: &mut ToolRegistry) {
        registry.register(Arc::new(ListEventsTool {
            tools: Arc::clone(&tools),
        }));
        registry.register(Arc::new(AddEventTool {
            tools: Arc::clone(&tools),
        }));
        registry.register(Arc::new(UpdateEventTool {
            tools: Arc::clone(&tools),
        }));
        registry.register(Arc::new(DeleteEventsTool { tools }));
    }

    /// Turn an operation failure into a tool error the backend can read.
    fn failure(&self, err: CalendarError) -> ToolOutput {
        if self.structured {
            ToolOutput::error(json!({ "error": err.to_string() }).to_string())
        } else {
            ToolOutput::error(format!("Error: {err}"))
        }
    }

    fn finish(&self, result: Result<String>) -> ToolOutput {
        match result {
            Ok(text) => ToolOutput::llm_only(text),
            Err(e) => self.failure(e),
        }
    }
}

// ── Argument helpers ─────────────────────────────────────────────────────────

fn str_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    str_arg(args, name)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| CalendarError::Tool(format!("'{name}' is required")))
}

/// Ids may arrive as numbers or numeric strings.
fn id_value(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn opt_string(args: &Value, name: &str) -> Option<String> {
    str_arg(args, name).map(String::from)
}

// ── Agent tool wrappers ──────────────────────────────────────────────────────

/// `list_events(start_iso, end_iso)`
pub struct ListEventsTool {
    tools: Arc<CalendarTools>,
}

#[async_trait]
impl Tool for ListEventsTool {
    fn name(&self) -> &str {
        "list_events"
    }

    fn description(&self) -> &str {
        "Lists calendar events within an ISO 8601 datetime range. \
         Use it to find event IDs before updating or deleting."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "start_iso": {
                    "type": "string",
                    "description": "Start of the range in ISO 8601 format"
                },
                "end_iso": {
                    "type": "string",
                    "description": "End of the range in ISO 8601 format"
                }
            },
            "required": ["start_iso", "end_iso"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let result = async {
            let start = required_str(&args, "start_iso")?;
            let end = required_str(&args, "end_iso")?;
            self.tools.list_events(start, end, &ctx.telemetry).await
        }
        .await;
        Ok(self.tools.finish(result))
    }
}

/// `add_event(title, start_iso, end_iso, location?, notes?)`
pub struct AddEventTool {
    tools: Arc<CalendarTools>,
}

#[async_trait]
impl Tool for AddEventTool {
    fn name(&self) -> &str {
        "add_event"
    }

    fn description(&self) -> &str {
        "Adds a new event to the calendar."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "description": "Title of the event" },
                "start_iso": { "type": "string", "description": "Start time in ISO 8601 format" },
                "end_iso": { "type": "string", "description": "End time in ISO 8601 format" },
                "location": { "type": "string", "description": "Optional location" },
                "notes": { "type": "string", "description": "Optional notes" }
            },
            "required": ["title", "start_iso", "end_iso"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let result = async {
            let title = required_str(&args, "title")?;
            let start = required_str(&args, "start_iso")?;
            let end = required_str(&args, "end_iso")?;
            self.tools
                .add_event(
                    title,
                    start,
                    end,
                    str_arg(&args, "location"),
                    str_arg(&args, "notes"),
                )
                .await
        }
        .await;
        Ok(self.tools.finish(result))
    }
}

/// `update_event(event_id, title?, start_iso?, end_iso?, location?, notes?)`
pub struct UpdateEventTool {
    tools: Arc<CalendarTools>,
}

#[async_trait]
impl Tool for UpdateEventTool {
    fn name(&self) -> &str {
        "update_event"
    }

    fn description(&self) -> &str {
        "Updates an existing calendar event. Only the given fields change; \
         an empty location or notes clears it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "event_id": { "type": "integer", "description": "ID of the event to update" },
                "title": { "type": "string", "description": "New title" },
                "start_iso": { "type": "string", "description": "New start time" },
                "end_iso": { "type": "string", "description": "New end time" },
                "location": { "type": "string", "description": "New location" },
                "notes": { "type": "string", "description": "New notes" }
            },
            "required": ["event_id"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let result = async {
            let event_id = args
                .get("event_id")
                .and_then(id_value)
                .ok_or_else(|| CalendarError::Tool("'event_id' must be an integer".into()))?;
            let update = EventUpdate {
                title: opt_string(&args, "title"),
                start_iso: opt_string(&args, "start_iso"),
                end_iso: opt_string(&args, "end_iso"),
                location: opt_string(&args, "location"),
                notes: opt_string(&args, "notes"),
            };
            self.tools.update_event(event_id, update).await
        }
        .await;
        Ok(self.tools.finish(result))
    }
}

/// `delete_events(event_ids)`
pub struct DeleteEventsTool {
    tools: Arc<CalendarTools>,
}

#[async_trait]
impl Tool for DeleteEventsTool {
    fn name(&self) -> &str {
        "delete_events"
    }

    fn description(&self) -> &str {
        "Deletes one or more calendar events by their IDs."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "event_ids": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "IDs of the events to delete"
                }
            },
            "required": ["event_ids"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let result = async {
            let ids = args
                .get("event_ids")
                .and_then(Value::as_array)
                .ok_or_else(|| CalendarError::Tool("'event_ids' must be an array".into()))?
                .iter()
                .map(|v| {
                    id_value(v).ok_or_else(|| {
                        CalendarError::Tool(format!("event id {v} is not an integer"))
                    })
                })
                .collect::<Result<Vec<i64>>>()?;
            self.tools.delete_events(&ids).await
        }
        .await;
        Ok(self.tools.finish(result))
    }
}

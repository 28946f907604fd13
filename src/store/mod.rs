//! Calendar event model and the [`EventStore`] collaborator.
//!
//! [`JsonEventStore`] keeps events in an in-memory map and optionally mirrors
//! them to a pretty-printed JSON file. A mutation is written to disk before
//! it becomes visible in memory, so a failed write leaves the store
//! unchanged and the caller sees an error (and never invalidates caches).
//!
//! # Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use calendar_assistant::store::{EventStore, JsonEventStore, NewEvent};
//! use calendar_assistant::timeparse::parse_timestamp;
//! use chrono::FixedOffset;
//!
//! let tz = FixedOffset::east_opt(3600).unwrap();
//! let store = JsonEventStore::new_in_memory();
//! let start = parse_timestamp("2026-02-10T10:00:00", tz).unwrap();
//! let end = parse_timestamp("2026-02-10T11:00:00", tz).unwrap();
//! let event = store.add(NewEvent::new("Standup", start, end)).await.unwrap();
//! assert_eq!(event.id, 1);
//! assert_eq!(store.query(start, end).await.unwrap().len(), 1);
//! # });
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{CalendarError, Result};

/// A stored calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: i64,
    pub title: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl CalendarEvent {
    /// Whether the event intersects the half-open interval `[start, end)`.
    pub fn overlaps(&self, start: &DateTime<FixedOffset>, end: &DateTime<FixedOffset>) -> bool {
        self.start < *end && self.end > *start
    }
}

/// Fields for a new event. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub title: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

impl NewEvent {
    pub fn new(
        title: impl Into<String>,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            title: title.into(),
            start,
            end,
            location: None,
            notes: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Partial update; `None` leaves a field untouched. An empty location or
/// notes string clears that field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub title: Option<String>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn apply(&self, event: &mut CalendarEvent) {
        if let Some(title) = &self.title {
            event.title = title.trim().to_string();
        }
        if let Some(start) = self.start {
            event.start = start;
        }
        if let Some(end) = self.end {
            event.end = end;
        }
        if let Some(location) = &self.location {
            event.location = non_empty(location);
        }
        if let Some(notes) = &self.notes {
            event.notes = non_empty(notes);
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn validate(title: &str, start: &DateTime<FixedOffset>, end: &DateTime<FixedOffset>) -> Result<()> {
    if title.trim().is_empty() {
        return Err(CalendarError::InvalidInput("title must not be empty".into()));
    }
    if start >= end {
        return Err(CalendarError::InvalidInput(format!(
            "start {} must be before end {}",
            start.to_rfc3339(),
            end.to_rfc3339()
        )));
    }
    Ok(())
}

/// Storage backend for calendar events.
///
/// Mutations either commit fully and return `Ok`, or leave the store
/// untouched and return `Err`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events overlapping `[start, end)`, ordered by start then id.
    async fn query(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<CalendarEvent>>;

    async fn add(&self, event: NewEvent) -> Result<CalendarEvent>;

    async fn update(&self, id: i64, patch: EventPatch) -> Result<CalendarEvent>;

    /// Delete every listed id that exists; returns the ids actually removed.
    async fn delete(&self, ids: &[i64]) -> Result<Vec<i64>>;
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    events: BTreeMap<i64, CalendarEvent>,
    next_id: i64,
}

impl StoreState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id = self.next_id.max(1);
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Async event store backed by an in-memory map and optional JSON file.
///
/// Clone is cheap; all clones share the same state.
#[derive(Clone)]
pub struct JsonEventStore {
    state: Arc<RwLock<StoreState>>,
    path: Option<PathBuf>,
}

impl JsonEventStore {
    /// Create a store backed by a JSON file at `path`.
    ///
    /// Call [`load`](Self::load) after construction to restore persisted events.
    pub fn new(path: PathBuf) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            path: Some(path),
        }
    }

    /// Create an in-memory-only store.
    pub fn new_in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            path: None,
        }
    }

    /// Load events from the backing file. No-op if it does not exist.
    pub async fn load(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CalendarError::Store(format!("{}: {}", path.display(), e)))?;
        let events: Vec<CalendarEvent> = serde_json::from_str(&data)
            .map_err(|e| CalendarError::Store(format!("{}: {}", path.display(), e)))?;

        let mut state = self.state.write().await;
        state.events = events.into_iter().map(|e| (e.id, e)).collect();
        state.next_id = state.events.keys().next_back().map_or(1, |max| max + 1);
        debug!(path = %path.display(), events = state.events.len(), "Loaded event store");
        Ok(())
    }

    /// Write `events` to disk through a sibling temp file renamed over the
    /// target, so an interrupted write never truncates the store. No-op for
    /// in-memory stores.
    async fn save(&self, events: &BTreeMap<i64, CalendarEvent>) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let list: Vec<&CalendarEvent> = events.values().collect();
        let data = serde_json::to_string_pretty(&list)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CalendarError::Store(format!("{}: {}", parent.display(), e)))?;
        }
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, data)
            .await
            .map_err(|e| CalendarError::Store(format!("{}: {}", temp_path.display(), e)))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| CalendarError::Store(format!("{}: {}", path.display(), e)))
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Add a few demo events around `now` when the store is empty.
    ///
    /// Returns how many events were added.
    pub async fn seed_if_empty(&self, now: DateTime<FixedOffset>) -> Result<usize> {
        if !self.is_empty().await {
            return Ok(0);
        }
        let tz = *now.offset();
        let today = now.date_naive();
        let slot = |days: i64, hour: u32, minute: u32, minutes: i64| {
            let date = today + Duration::days(days);
            let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
            let start = tz.from_local_datetime(&date.and_time(time)).single()?;
            Some((start, start + Duration::minutes(minutes)))
        };

        let demo = [
            ("Team standup", slot(1, 9, 30, 30), Some("Office"), None),
            (
                "Project review",
                slot(1, 14, 0, 60),
                Some("Meeting room B"),
                Some("Bring the Q1 numbers"),
            ),
            ("Dentist", slot(2, 16, 0, 60), None, None),
            ("Dinner with friends", slot(4, 20, 0, 120), Some("Trattoria"), None),
        ];

        let mut added = 0;
        for (title, times, location, notes) in demo {
            let Some((start, end)) = times else { continue };
            let mut event = NewEvent::new(title, start, end);
            event.location = location.map(String::from);
            event.notes = notes.map(String::from);
            self.add(event).await?;
            added += 1;
        }
        info!(added, "Seeded demo events");
        Ok(added)
    }
}

#[async_trait]
impl EventStore for JsonEventStore {
    async fn query(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<CalendarEvent>> {
        if start >= end {
            return Err(CalendarError::InvalidInput(format!(
                "range start {} must be before end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        let state = self.state.read().await;
        let mut events: Vec<CalendarEvent> = state
            .events
            .values()
            .filter(|e| e.overlaps(&start, &end))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn add(&self, event: NewEvent) -> Result<CalendarEvent> {
        validate(&event.title, &event.start, &event.end)?;

        let mut state = self.state.write().await;
        let mut next = state.clone();
        let id = next.allocate_id();
        let created = CalendarEvent {
            id,
            title: event.title.trim().to_string(),
            start: event.start,
            end: event.end,
            location: event.location.as_deref().and_then(non_empty),
            notes: event.notes.as_deref().and_then(non_empty),
        };
        next.events.insert(id, created.clone());
        self.save(&next.events).await?;
        *state = next;
        debug!(id, "Event added");
        Ok(created)
    }

    async fn update(&self, id: i64, patch: EventPatch) -> Result<CalendarEvent> {
        let mut state = self.state.write().await;
        let mut updated = state
            .events
            .get(&id)
            .cloned()
            .ok_or_else(|| CalendarError::NotFound(format!("event {id}")))?;
        patch.apply(&mut updated);
        validate(&updated.title, &updated.start, &updated.end)?;

        let mut next = state.events.clone();
        next.insert(id, updated.clone());
        self.save(&next).await?;
        state.events = next;
        debug!(id, "Event updated");
        Ok(updated)
    }

    async fn delete(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let mut state = self.state.write().await;
        let mut next = state.events.clone();
        let mut deleted = Vec::new();
        for id in ids {
            if next.remove(id).is_some() {
                deleted.push(*id);
            }
        }
        if deleted.is_empty() {
            return Ok(deleted);
        }
        self.save(&next).await?;
        state.events = next;
        debug!(?deleted, "Events deleted");
        Ok(deleted)
    }
}

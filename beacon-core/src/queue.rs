//! Persistent per-collection event queue
//!
//! The whole queue is one document in the [`DurableStore`] under
//! `event_queue::<app_id>`, shaped exactly like the collector's request
//! body: a map from collection name to an array of payload objects.
//!
//! ## Timestamps
//!
//! Every payload carries its capture time in `keen.timestamp`
//! (RFC 3339, UTC, millisecond precision). A caller-supplied `keen`
//! object is kept and the timestamp merged into it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::store::DurableStore;

/// Payload key holding collector metadata
const KEEN_KEY: &str = "keen";
/// Field inside `keen` holding the capture time
const TIMESTAMP_KEY: &str = "timestamp";

/// A recorded payload
///
/// Immutable once queued. The collection it belongs to is the key it
/// is filed under in a [`Batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Map<String, Value>", try_from = "Map<String, Value>")]
pub struct Event {
    /// Caller-supplied document, without the injected timestamp
    pub payload: Map<String, Value>,
    /// When the event was recorded
    pub recorded_at: DateTime<Utc>,
}

impl Event {
    /// Record a payload now
    pub fn new(payload: Map<String, Value>) -> Self {
        Self::at(payload, Utc::now())
    }

    /// Record a payload at a given time
    pub fn at(payload: Map<String, Value>, recorded_at: DateTime<Utc>) -> Self {
        // Truncate to the precision that survives serialization
        let recorded_at = DateTime::parse_from_rfc3339(&format_timestamp(&recorded_at))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(recorded_at);
        Self {
            payload,
            recorded_at,
        }
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl From<Event> for Map<String, Value> {
    fn from(event: Event) -> Self {
        let mut map = event.payload;
        let timestamp = Value::String(format_timestamp(&event.recorded_at));
        match map.get_mut(KEEN_KEY) {
            Some(Value::Object(keen)) => {
                keen.insert(TIMESTAMP_KEY.to_string(), timestamp);
            }
            _ => {
                let mut keen = Map::new();
                keen.insert(TIMESTAMP_KEY.to_string(), timestamp);
                map.insert(KEEN_KEY.to_string(), Value::Object(keen));
            }
        }
        map
    }
}

impl TryFrom<Map<String, Value>> for Event {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        let Some(Value::Object(keen)) = map.get_mut(KEEN_KEY) else {
            return Err("event is missing its keen object".to_string());
        };
        let raw = match keen.remove(TIMESTAMP_KEY) {
            Some(Value::String(raw)) => raw,
            _ => return Err("event is missing keen.timestamp".to_string()),
        };
        let recorded_at = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| format!("invalid keen.timestamp {:?}: {}", raw, e))?
            .with_timezone(&Utc);
        if keen.is_empty() {
            map.remove(KEEN_KEY);
        }
        Ok(Event {
            payload: map,
            recorded_at,
        })
    }
}

/// Events grouped by collection, in recording order within each
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    collections: BTreeMap<String, Vec<Event>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to a collection
    pub fn push(&mut self, collection: impl Into<String>, event: Event) {
        self.collections
            .entry(collection.into())
            .or_default()
            .push(event);
    }

    /// Events recorded for one collection
    pub fn get(&self, collection: &str) -> Option<&[Event]> {
        self.collections.get(collection).map(Vec::as_slice)
    }

    /// Iterate collections with their events
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Event])> {
        self.collections
            .iter()
            .map(|(name, events)| (name.as_str(), events.as_slice()))
    }

    /// Total number of events across collections
    pub fn len(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.values().all(Vec::is_empty)
    }

    /// Remove events that were part of an earlier snapshot
    ///
    /// For each collection, drops the leading events that match the
    /// snapshot's events in order and stops at the first mismatch.
    /// Anything appended after the snapshot stays. Returns how many
    /// events were removed.
    pub fn remove_delivered(&mut self, delivered: &Batch) -> usize {
        let mut removed = 0;
        for (name, sent) in &delivered.collections {
            let Some(queued) = self.collections.get_mut(name) else {
                continue;
            };
            let matching = queued
                .iter()
                .zip(sent)
                .take_while(|(queued, sent)| queued == sent)
                .count();
            queued.drain(..matching);
            removed += matching;
            if queued.is_empty() {
                self.collections.remove(name);
            }
        }
        removed
    }
}

/// Queue of events awaiting dispatch for one application
pub struct EventQueue {
    store: Arc<DurableStore>,
    key: String,
}

impl EventQueue {
    /// Queue persisted under `event_queue::<app_id>`
    pub fn new(store: Arc<DurableStore>, app_id: &str) -> Self {
        Self {
            store,
            key: queue_key(app_id),
        }
    }

    /// Store key holding this queue
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record a payload at the end of `collection` and persist the queue
    pub fn enqueue(&self, collection: &str, payload: Map<String, Value>) -> Result<Event> {
        let event = Event::new(payload);
        self.store.update(&self.key, |batch: &mut Batch| {
            batch.push(collection, event.clone());
        })?;
        tracing::debug!(collection, "Event queued");
        Ok(event)
    }

    /// Current contents, without modifying the queue
    ///
    /// An absent or unreadable document reads as an empty queue.
    pub fn snapshot(&self) -> Batch {
        self.store.get(&self.key).unwrap_or_default()
    }

    /// Persist an empty queue
    pub fn clear(&self) -> Result<()> {
        self.store.put(&self.key, &Batch::default())
    }

    /// Remove the events of a delivered (or discarded) snapshot
    pub fn remove_delivered(&self, delivered: &Batch) -> Result<usize> {
        self.store
            .update(&self.key, |batch: &mut Batch| batch.remove_delivered(delivered))
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

/// Store key of the event queue for an application
pub fn queue_key(app_id: &str) -> String {
    format!("event_queue::{app_id}")
}

//! Batch record: persisted state of one batch.
//!
//! The lifecycle timestamps are monotonic. Each one is written at most once,
//! through [`BatchRecord::stamp`], and never cleared. `enqueued_at` is written
//! by the defining caller; the rest belong to the completion evaluator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{BatchError, BatchResult};
use crate::id::BatchId;
use crate::value::ArgValue;

/// Lifecycle event that may trigger a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEvent {
    /// First member job finished with an error.
    Discard,
    /// All member jobs finished and none was discarded.
    Success,
    /// All member jobs finished, discarded or not.
    Finish,
}

impl BatchEvent {
    pub const ALL: [BatchEvent; 3] = [BatchEvent::Discard, BatchEvent::Success, BatchEvent::Finish];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchEvent::Discard => "discard",
            BatchEvent::Success => "success",
            BatchEvent::Finish => "finish",
        }
    }
}

impl fmt::Display for BatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchEvent {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" => Ok(BatchEvent::Discard),
            "success" => Ok(BatchEvent::Success),
            "finish" => Ok(BatchEvent::Finish),
            other => Err(BatchError::invalid_argument(format!(
                "unknown batch event '{other}'"
            ))),
        }
    }
}

/// One of the lifecycle timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchTimestamp {
    Enqueued,
    Discarded,
    Finished,
    CallbacksFinished,
}

impl BatchTimestamp {
    /// Column name in the durable schema.
    pub fn column(&self) -> &'static str {
        match self {
            BatchTimestamp::Enqueued => "enqueued_at",
            BatchTimestamp::Discarded => "discarded_at",
            BatchTimestamp::Finished => "finished_at",
            BatchTimestamp::CallbacksFinished => "callbacks_finished_at",
        }
    }
}

/// Coarse lifecycle position of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Still being defined; `enqueued_at` is null.
    Defining,
    /// Enqueued, member jobs outstanding.
    Running,
    /// Finished, callback jobs outstanding.
    Finished,
    /// Finished and every callback job finished.
    CallbacksFinished,
}

/// Dispatch parameters and targets for lifecycle callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub queue_name: String,
    pub priority: i32,
    pub on_success: Option<String>,
    pub on_discard: Option<String>,
    pub on_finish: Option<String>,
}

impl CallbackConfig {
    /// Configured target name for an event, if any.
    pub fn target(&self, event: BatchEvent) -> Option<&str> {
        match event {
            BatchEvent::Discard => self.on_discard.as_deref(),
            BatchEvent::Success => self.on_success.as_deref(),
            BatchEvent::Finish => self.on_finish.as_deref(),
        }
    }

    /// All configured target names.
    pub fn targets(&self) -> impl Iterator<Item = (BatchEvent, &str)> {
        BatchEvent::ALL
            .into_iter()
            .filter_map(|event| self.target(event).map(|name| (event, name)))
    }
}

/// Open key/value metadata attached to a batch.
///
/// Always a map; an unset value reads as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, ArgValue>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Option<ArgValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }

    pub fn into_value(self) -> ArgValue {
        ArgValue::Map(self.0)
    }

    /// Encode with the job-argument serialization.
    pub fn to_json(&self) -> BatchResult<JsonValue> {
        ArgValue::Map(self.0.clone()).to_json()
    }

    /// Decode a stored value. Null decodes to an empty map.
    pub fn from_json(value: &JsonValue) -> BatchResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Self::try_from(ArgValue::from_json(value)?)
            .map_err(|e| BatchError::serialization(e.to_string()))
    }
}

impl TryFrom<ArgValue> for Properties {
    type Error = BatchError;

    /// Accepts only map values, and only maps that encode cleanly.
    fn try_from(value: ArgValue) -> Result<Self, Self::Error> {
        match value {
            ArgValue::Map(entries) => {
                let properties = Self(entries);
                properties
                    .to_json()
                    .map_err(|e| BatchError::invalid_argument(format!("properties: {e}")))?;
                Ok(properties)
            }
            other => Err(BatchError::invalid_argument(format!(
                "properties must be a map, got {}",
                other.kind_name()
            ))),
        }
    }
}

impl<K: Into<String>, V: Into<ArgValue>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Persisted state of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub callbacks_finished_at: Option<DateTime<Utc>>,
    pub callbacks: CallbackConfig,
    pub properties: Properties,
}

impl BatchRecord {
    pub fn is_enqueued(&self) -> bool {
        self.enqueued_at.is_some()
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Finished and no member job was discarded.
    pub fn is_succeeded(&self) -> bool {
        self.is_finished() && !self.is_discarded()
    }

    pub fn are_callbacks_finished(&self) -> bool {
        self.callbacks_finished_at.is_some()
    }

    pub fn state(&self) -> BatchState {
        if self.are_callbacks_finished() {
            BatchState::CallbacksFinished
        } else if self.is_finished() {
            BatchState::Finished
        } else if self.is_enqueued() {
            BatchState::Running
        } else {
            BatchState::Defining
        }
    }

    pub fn timestamp(&self, field: BatchTimestamp) -> Option<DateTime<Utc>> {
        match field {
            BatchTimestamp::Enqueued => self.enqueued_at,
            BatchTimestamp::Discarded => self.discarded_at,
            BatchTimestamp::Finished => self.finished_at,
            BatchTimestamp::CallbacksFinished => self.callbacks_finished_at,
        }
    }

    /// Set a lifecycle timestamp if it is still null.
    ///
    /// Returns `false` (and leaves the record untouched) when the field was
    /// already set.
    pub fn stamp(&mut self, field: BatchTimestamp, at: DateTime<Utc>) -> bool {
        let slot = match field {
            BatchTimestamp::Enqueued => &mut self.enqueued_at,
            BatchTimestamp::Discarded => &mut self.discarded_at,
            BatchTimestamp::Finished => &mut self.finished_at,
            BatchTimestamp::CallbacksFinished => &mut self.callbacks_finished_at,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }

    /// Replace the properties. Non-map values are rejected and leave the
    /// previous properties in place.
    pub fn set_properties(&mut self, value: ArgValue) -> BatchResult<()> {
        self.properties = Properties::try_from(value)?;
        Ok(())
    }
}

/// Definition of a batch about to be created.
#[derive(Debug, Clone, Default)]
pub struct NewBatch {
    pub description: Option<String>,
    pub callback_queue_name: Option<String>,
    pub callback_priority: Option<i32>,
    pub on_success: Option<String>,
    pub on_discard: Option<String>,
    pub on_finish: Option<String>,
    pub properties: Properties,
}

impl NewBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn on_success(mut self, target: impl Into<String>) -> Self {
        self.on_success = Some(target.into());
        self
    }

    pub fn on_discard(mut self, target: impl Into<String>) -> Self {
        self.on_discard = Some(target.into());
        self
    }

    pub fn on_finish(mut self, target: impl Into<String>) -> Self {
        self.on_finish = Some(target.into());
        self
    }

    pub fn callback_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.callback_queue_name = Some(queue_name.into());
        self
    }

    pub fn callback_priority(mut self, priority: i32) -> Self {
        self.callback_priority = Some(priority);
        self
    }

    /// Attach properties. Non-map values are rejected.
    pub fn properties(mut self, value: ArgValue) -> BatchResult<Self> {
        self.properties = Properties::try_from(value)?;
        Ok(self)
    }

    /// Materialise the record, filling callback dispatch defaults.
    pub fn into_record(self, default_queue: &str, default_priority: i32) -> BatchRecord {
        BatchRecord {
            id: BatchId::new(),
            created_at: Utc::now(),
            description: self.description,
            enqueued_at: None,
            discarded_at: None,
            finished_at: None,
            callbacks_finished_at: None,
            callbacks: CallbackConfig {
                queue_name: self
                    .callback_queue_name
                    .unwrap_or_else(|| default_queue.to_string()),
                priority: self.callback_priority.unwrap_or(default_priority),
                on_success: self.on_success,
                on_discard: self.on_discard,
                on_finish: self.on_finish,
            },
            properties: self.properties,
        }
    }
}

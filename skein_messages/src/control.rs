use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::{Error, Result};
use crate::payload::Payload;

/// Category discriminator for queued tasks.
///
/// The first categorized task pins the category for the lifetime of the
/// message; a message never carries inference and training work at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[default]
    None,
    Inference,
    Training,
}

impl TaskCategory {
    pub fn from_task_type(task_type: &str) -> Self {
        match task_type {
            "inference" => Self::Inference,
            "training" => Self::Training,
            _ => Self::None,
        }
    }
}

/// Queue of typed tasks plus mutable metadata and an opaque payload slot.
///
/// Tasks of one type drain FIFO. Metadata is a flat JSON object readable by
/// any node in a run; the payload is shared with whoever asks for it.
#[derive(Debug, Clone, Default)]
pub struct ControlMessage {
    tasks: Map<String, Value>,
    metadata: Map<String, Value>,
    category: TaskCategory,
    payload: Option<Arc<Payload>>,
}

impl ControlMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a message from a config object.
    ///
    /// Recognized keys: `type` (seeds the category), `tasks` (array of
    /// `{type, properties}` entries) and `metadata` (object). Anything else
    /// is ignored.
    pub fn from_config(config: &Value) -> Result<Self> {
        let obj = config
            .as_object()
            .ok_or_else(|| Error::invalid_config("config must be an object"))?;

        let mut message = Self::new();

        if let Some(kind) = obj.get("type") {
            let kind = kind
                .as_str()
                .ok_or_else(|| Error::invalid_config("'type' must be a string"))?;
            message.category = TaskCategory::from_task_type(kind);
        }

        if let Some(tasks) = obj.get("tasks") {
            let entries = tasks
                .as_array()
                .ok_or_else(|| Error::invalid_config("'tasks' must be an array"))?;
            for entry in entries {
                let task_type = entry
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_config("task entries require a string 'type'"))?;
                let properties = entry
                    .get("properties")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                message.add_task(task_type, properties)?;
            }
        }

        if let Some(metadata) = obj.get("metadata") {
            let entries = metadata
                .as_object()
                .ok_or_else(|| Error::invalid_config("'metadata' must be an object"))?;
            for (key, value) in entries {
                message.set_metadata(key, value.clone());
            }
        }

        Ok(message)
    }

    /// Append a task to the type's queue.
    ///
    /// The first inference or training task sets the message category; adding
    /// a task of the opposite category afterwards fails.
    pub fn add_task(&mut self, task_type: &str, task: Value) -> Result<()> {
        trace!(task_type, "adding task to control message");
        let category = TaskCategory::from_task_type(task_type);

        if self.category == TaskCategory::None {
            self.category = category;
        }

        if category != TaskCategory::None && self.category != category {
            return Err(Error::MixedTaskCategories);
        }

        let queue = self
            .tasks
            .entry(task_type.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = queue {
            items.push(task);
        }
        Ok(())
    }

    pub fn has_task(&self, task_type: &str) -> bool {
        self.tasks
            .get(task_type)
            .and_then(Value::as_array)
            .is_some_and(|items| !items.is_empty())
    }

    /// Pop the oldest task of the given type.
    pub fn remove_task(&mut self, task_type: &str) -> Result<Value> {
        let queue = self
            .tasks
            .get_mut(task_type)
            .and_then(Value::as_array_mut)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| Error::TaskNotFound(task_type.to_string()))?;
        Ok(queue.remove(0))
    }

    pub fn get_tasks(&self) -> Value {
        Value::Object(self.tasks.clone())
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        if self.metadata.contains_key(key) {
            trace!(key, "overwriting metadata key");
        }
        self.metadata.insert(key.to_string(), value);
    }

    pub fn get_metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn get_metadata_key(&self, key: &str) -> Result<Value> {
        self.metadata
            .get(key)
            .cloned()
            .ok_or_else(|| Error::MetadataNotFound(key.to_string()))
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    pub fn list_metadata(&self) -> Vec<String> {
        self.metadata.keys().cloned().collect()
    }

    /// Shared handle to the attached payload, if any.
    pub fn payload(&self) -> Option<Arc<Payload>> {
        self.payload.clone()
    }

    pub fn set_payload(&mut self, payload: Arc<Payload>) {
        self.payload = Some(payload);
    }

    pub fn category(&self) -> TaskCategory {
        self.category
    }
}

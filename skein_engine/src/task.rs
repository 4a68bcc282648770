use serde_json::Value;

/// One unit of LLM work drained from a control message's `llm_engine` queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    pub task_type: String,
    pub task_dict: Value,
}

impl Task {
    pub fn new(task_type: impl Into<String>, task_dict: Value) -> Self {
        Self {
            task_type: task_type.into(),
            task_dict,
        }
    }

    /// Look up a key in the task dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.task_dict.get(key)
    }
}

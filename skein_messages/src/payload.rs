use serde_json::Value;

/// Opaque record batch attached to a [`ControlMessage`](crate::ControlMessage).
///
/// The engine never interprets the contents; nodes and task handlers read
/// whatever shape the upstream pipeline produced. Reads hand out a shared
/// handle rather than transferring ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    rows: Value,
}

impl Payload {
    pub fn new(rows: Value) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &Value {
        &self.rows
    }

    /// Number of top-level records when the rows are an array, zero otherwise.
    pub fn count(&self) -> usize {
        self.rows.as_array().map_or(0, Vec::len)
    }
}

//! Hierarchical execution context.
//!
//! A run owns a tree of contexts sharing one [`ContextState`]. Each context
//! accumulates local outputs while it executes; completing it publishes the
//! filtered outputs into the shared `values` map under the context's path and
//! fires its one-shot readiness signal. Input resolution reads `values` and
//! suspends on entries that have not been published yet.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::trace;

use skein_messages::ControlMessage;

use crate::error::{Error, Result};
use crate::input_map::InputBinding;
use crate::task::Task;

/// Shared handle to the control message a run operates on.
pub type SharedMessage = Arc<tokio::sync::Mutex<ControlMessage>>;

/// State shared by every context in one execution tree.
#[derive(Debug)]
pub struct ContextState {
    task: Task,
    message: SharedMessage,
    values: RwLock<Map<String, Value>>,
    publications: watch::Sender<u64>,
    retired: watch::Sender<bool>,
}

impl ContextState {
    fn new(task: Task, message: SharedMessage) -> Self {
        Self {
            task,
            message,
            values: RwLock::new(Map::new()),
            publications: watch::channel(0).0,
            retired: watch::channel(false).0,
        }
    }

    /// Snapshot of every published output in the tree.
    fn values(&self) -> Value {
        let values = self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Value::Object(values.clone())
    }

    /// Write `outputs` at the slot addressed by `segments` and wake resolvers.
    ///
    /// An empty segment list is the root context publishing: its keys merge
    /// into the top level of `values`.
    fn publish(&self, segments: &[String], outputs: Map<String, Value>) {
        {
            let mut values = self
                .values
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            write_at(&mut values, segments, outputs);
        }
        self.publications.send_modify(|epoch| *epoch += 1);
    }

    fn lookup(&self, segments: &[String]) -> Option<Value> {
        let values = self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let (first, rest) = segments.split_first()?;
        let mut current = values.get(first)?;
        for segment in rest {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    fn retire(&self) {
        self.retired.send_replace(true);
    }

    fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }
}

fn write_at(target: &mut Map<String, Value>, segments: &[String], outputs: Map<String, Value>) {
    match segments.split_first() {
        None => {
            for (key, value) in outputs {
                target.insert(key, value);
            }
        }
        Some((first, rest)) => {
            let child = target
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if rest.is_empty() {
                *child = Value::Object(outputs);
            } else {
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                if let Value::Object(map) = child {
                    write_at(map, rest, outputs);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct OutputSlot {
    values: Map<String, Value>,
    output_names: Vec<String>,
    published: bool,
}

/// One frame of the execution tree.
///
/// Children are created with [`Context::push`] and share the parent's state;
/// a child's lifetime is bounded by its parent's activation.
#[derive(Debug)]
pub struct Context {
    parent: Option<Arc<Context>>,
    name: String,
    inputs: Vec<InputBinding>,
    state: Arc<ContextState>,
    outputs: Mutex<OutputSlot>,
    ready: watch::Sender<bool>,
}

impl Context {
    /// Root context for one drained task. Empty name, empty inputs, fresh
    /// shared state.
    pub fn construct_root(task: Task, message: SharedMessage) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            name: String::new(),
            inputs: Vec::new(),
            state: Arc::new(ContextState::new(task, message)),
            outputs: Mutex::new(OutputSlot::default()),
            ready: watch::channel(false).0,
        })
    }

    /// Child context sharing this context's state.
    pub fn push(
        self: &Arc<Self>,
        name: impl Into<String>,
        inputs: Vec<InputBinding>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptyNodeName);
        }
        Ok(Arc::new(Self {
            parent: Some(self.clone()),
            name,
            inputs,
            state: self.state.clone(),
            outputs: Mutex::new(OutputSlot::default()),
            ready: watch::channel(false).0,
        }))
    }

    /// Unwind this frame back to the parent. The outputs must already have
    /// been promoted via [`outputs_complete`](Self::outputs_complete).
    pub fn pop(&self) {
        trace!(context = %self.full_name(), "context popped");
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_map(&self) -> &[InputBinding] {
        &self.inputs
    }

    pub fn task(&self) -> &Task {
        &self.state.task
    }

    pub fn message(&self) -> SharedMessage {
        self.state.message.clone()
    }

    /// Slash-joined path from the root; the root itself is `/`.
    pub fn full_name(&self) -> String {
        match &self.parent {
            None => "/".to_string(),
            Some(parent) => {
                let base = parent.full_name();
                if base == "/" {
                    format!("/{}", self.name)
                } else {
                    format!("{}/{}", base, self.name)
                }
            }
        }
    }

    fn path_segments(&self) -> Vec<String> {
        match &self.parent {
            None => Vec::new(),
            Some(parent) => {
                let mut segments = parent.path_segments();
                segments.push(self.name.clone());
                segments
            }
        }
    }

    /// Every published output in the tree, for inspection.
    pub fn all_outputs(&self) -> Value {
        self.state.values()
    }

    /// The local outputs written so far, published or not.
    pub fn view_outputs(&self) -> Value {
        Value::Object(self.lock_outputs().values.clone())
    }

    /// Replace the local outputs wholesale. Valid only before publication.
    pub fn set_output(&self, outputs: Value) -> Result<()> {
        let Value::Object(map) = outputs else {
            return Err(Error::InvalidOutputs(json_type_name(&outputs)));
        };
        let mut slot = self.lock_outputs();
        if slot.published {
            return Err(Error::OutputsClosed(self.full_name()));
        }
        slot.values = map;
        Ok(())
    }

    /// Assign a single key in the local outputs. Valid only before
    /// publication.
    pub fn set_output_key(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let mut slot = self.lock_outputs();
        if slot.published {
            return Err(Error::OutputsClosed(self.full_name()));
        }
        slot.values.insert(key.into(), value);
        Ok(())
    }

    /// Select the keys published at completion. Empty means publish all.
    pub fn set_output_names(&self, names: Vec<String>) -> Result<()> {
        let mut slot = self.lock_outputs();
        if slot.published {
            return Err(Error::OutputsClosed(self.full_name()));
        }
        slot.output_names = names;
        Ok(())
    }

    /// Promote the filtered outputs into the shared values map and fire the
    /// readiness signal. A second call is a contract violation.
    pub fn outputs_complete(&self) -> Result<()> {
        let published = {
            let mut slot = self.lock_outputs();
            if slot.published {
                return Err(Error::DoubleComplete(self.full_name()));
            }
            slot.published = true;
            if slot.output_names.is_empty() {
                slot.values.clone()
            } else {
                let mut subset = Map::new();
                for name in &slot.output_names {
                    if let Some(value) = slot.values.get(name) {
                        subset.insert(name.clone(), value.clone());
                    }
                }
                subset
            }
        };
        self.state.publish(&self.path_segments(), published);
        self.ready.send_replace(true);
        trace!(context = %self.full_name(), "outputs published");
        Ok(())
    }

    /// Wait until this context has published its outputs.
    ///
    /// Completes immediately if publication already happened. If the context
    /// is torn down without publishing, awaiters observe a failure rather
    /// than readiness.
    pub async fn outputs_ready(&self) -> Result<()> {
        let mut ready = self.ready.subscribe();
        loop {
            if *ready.borrow() {
                return Ok(());
            }
            ready
                .changed()
                .await
                .map_err(|_| Error::MissingInput(self.full_name()))?;
        }
    }

    /// Resolved value of the single declared input.
    pub async fn get_input(&self) -> Result<Value> {
        if self.inputs.len() != 1 {
            return Err(Error::InvalidArity(self.inputs.len()));
        }
        self.resolve_binding(&self.inputs[0]).await
    }

    /// Resolved value of the input whose internal name matches `node_name`.
    pub async fn get_input_named(&self, node_name: &str) -> Result<Value> {
        let binding = self
            .inputs
            .iter()
            .find(|binding| binding.internal_name == node_name)
            .ok_or_else(|| Error::UnknownInput(node_name.to_string()))?;
        self.resolve_binding(binding).await
    }

    /// Object mapping every declared internal name to its resolved value.
    pub async fn get_inputs(&self) -> Result<Value> {
        let mut inputs = Map::new();
        for binding in &self.inputs {
            let value = self.resolve_binding(binding).await?;
            inputs.insert(binding.internal_name.clone(), value);
        }
        Ok(Value::Object(inputs))
    }

    /// Mark the execution scope finished: pending and future resolutions of
    /// absent inputs fail instead of suspending.
    pub(crate) fn retire(&self) {
        self.state.retire();
    }

    /// Resolve one binding against the shared values map, suspending until
    /// the addressed slot is published or the scope retires.
    async fn resolve_binding(&self, binding: &InputBinding) -> Result<Value> {
        let segments = self.external_segments(&binding.external_name);
        let mut publications = self.state.publications.subscribe();
        loop {
            if let Some(value) = self.state.lookup(&segments) {
                return Ok(value);
            }
            let mut retired = self.state.retired.subscribe();
            if self.state.is_retired() {
                return Err(Error::MissingInput(binding.external_name.clone()));
            }
            tokio::select! {
                changed = publications.changed() => {
                    changed.map_err(|_| Error::MissingInput(binding.external_name.clone()))?;
                }
                _ = retired.changed() => {}
            }
        }
    }

    /// Path segments addressed by an external name. Absolute names walk from
    /// the root; relative names are prefixed with the parent's path. Both `/`
    /// and `.` descend into nested JSON.
    fn external_segments(&self, external: &str) -> Vec<String> {
        let mut segments = if external.starts_with('/') {
            Vec::new()
        } else {
            match &self.parent {
                Some(parent) => parent.path_segments(),
                None => Vec::new(),
            }
        };
        segments.extend(
            external
                .split(['/', '.'])
                .filter(|segment| !segment.is_empty())
                .map(String::from),
        );
        segments
    }

    fn lock_outputs(&self) -> std::sync::MutexGuard<'_, OutputSlot> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state_handle(&self) -> &Arc<ContextState> {
        &self.state
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

use std::sync::Arc;

use tracing::trace;

use skein_messages::ControlMessage;

use crate::context::Context;
use crate::error::Result;
use crate::input_map::InputBinding;
use crate::node::TaskHandler;

/// Binds a reconciled input mapping to a task handler and frames its
/// invocation in a child context.
pub struct TaskHandlerRunner {
    inputs: Vec<InputBinding>,
    handler: Arc<dyn TaskHandler>,
}

impl TaskHandlerRunner {
    pub fn new(inputs: Vec<InputBinding>, handler: Arc<dyn TaskHandler>) -> Self {
        Self { inputs, handler }
    }

    /// The bound mapping, for diagnostics.
    pub fn input_names(&self) -> &[InputBinding] {
        &self.inputs
    }

    /// Push a child context for the handler, invoke it, and pop the child on
    /// every exit path. The handler's result is returned verbatim.
    pub async fn try_handle(
        &self,
        context: &Arc<Context>,
    ) -> Result<Option<Vec<ControlMessage>>> {
        let child = context.push("task_handler", self.inputs.clone())?;
        let result = self.handler.try_handle(child.clone()).await;
        child.pop();
        if let Ok(Some(messages)) = &result {
            trace!(count = messages.len(), "task handler accepted the context");
        }
        result
    }
}

use std::sync::Arc;

use async_trait::async_trait;

use skein_messages::ControlMessage;

use crate::context::Context;
use crate::error::Result;

/// A computation attached to a context.
///
/// Implementations resolve their declared inputs from the context, compute,
/// and publish their outputs before returning.
#[async_trait]
pub trait Node: Send + Sync {
    /// Ordered list of input names this node expects.
    fn get_input_names(&self) -> Vec<String>;

    async fn execute(&self, context: Arc<Context>) -> Result<()>;
}

/// Inspects a completed context and gates downstream message emission.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Ordered list of input names this handler expects.
    fn get_input_names(&self) -> Vec<String>;

    /// `None` means "not my job, try the next handler". `Some(vec![])` is an
    /// accepted result that emits no downstream messages; the two are not
    /// interchangeable.
    async fn try_handle(&self, context: Arc<Context>) -> Result<Option<Vec<ControlMessage>>>;
}

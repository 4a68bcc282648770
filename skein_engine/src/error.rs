use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the execution core.
///
/// Every failure propagates to the top-level [`run`](crate::LlmEngine::run)
/// awaitable; the core performs no internal retries.
#[derive(Error, Debug)]
pub enum Error {
    #[error("run() called without a message")]
    NullMessage,

    #[error("run() called with a message that does not have the 'llm_engine' task")]
    NoEngineTask,

    #[error("drained task is malformed: {0}")]
    MalformedTask(String),

    #[error("expected exactly one declared input, found {0}")]
    InvalidArity(usize),

    #[error("no input named '{0}' declared on this context")]
    UnknownInput(String),

    #[error("input mapping declares {declared} entries but the node expects {required}")]
    InputArityMismatch { declared: usize, required: usize },

    #[error("input '{0}' was never produced")]
    MissingInput(String),

    #[error("no task handler accepted the generated outputs")]
    UnhandledOutputs,

    #[error("outputs_complete() called twice on context '{0}'")]
    DoubleComplete(String),

    #[error("outputs of context '{0}' are already published")]
    OutputsClosed(String),

    #[error("context outputs must be a JSON object, got {0}")]
    InvalidOutputs(&'static str),

    #[error("child context name must not be empty")]
    EmptyNodeName,

    #[error(transparent)]
    Message(#[from] skein_messages::Error),
}

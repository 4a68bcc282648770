//! skein_engine: execution core of the LLM-augmented message-processing engine.
//!
//! A control message carrying queued `llm_engine` tasks enters
//! [`LlmEngine::run`]. For each drained task the engine builds a root
//! [`Context`], executes the node graph against it, then walks the registered
//! task handlers until one accepts the accumulated outputs and emits zero or
//! more follow-up control messages.

#![forbid(unsafe_code)]

pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod input_map;
pub mod node;
pub mod task;

pub use context::{Context, ContextState, SharedMessage};
pub use engine::{LlmEngine, ENGINE_TASK};
pub use error::{Error, Result};
pub use handler::TaskHandlerRunner;
pub use input_map::{resolve_input_names, InputBinding, BIND_ALL};
pub use node::{Node, TaskHandler};
pub use task::Task;

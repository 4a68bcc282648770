use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use skein_messages::ControlMessage;

use crate::context::{Context, SharedMessage};
use crate::error::{Error, Result};
use crate::handler::TaskHandlerRunner;
use crate::input_map::{resolve_input_names, InputBinding};
use crate::node::{Node, TaskHandler};
use crate::task::Task;

/// The distinguished task type the engine drains from a control message.
pub const ENGINE_TASK: &str = "llm_engine";

/// Outer driver of the execution core.
///
/// Composes a base runner node (the external graph executor) with an ordered
/// list of task-handler runners. For each drained `llm_engine` task the
/// engine executes the node graph against a fresh root context, then consults
/// the handlers in registration order; the first one to return a defined
/// result wins.
pub struct LlmEngine {
    runner: Arc<dyn Node>,
    task_handlers: Vec<TaskHandlerRunner>,
}

impl LlmEngine {
    pub fn new(runner: Arc<dyn Node>) -> Self {
        Self {
            runner,
            task_handlers: Vec::new(),
        }
    }

    /// Register a task handler, reconciling the declared inputs against the
    /// handler's expected input names.
    pub fn add_task_handler(
        &mut self,
        inputs: Vec<InputBinding>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<()> {
        let input_names = handler.get_input_names();
        let final_inputs = resolve_input_names(&inputs, &input_names)?;
        self.task_handlers
            .push(TaskHandlerRunner::new(final_inputs, handler));
        Ok(())
    }

    /// Drain every `llm_engine` task from the message and return the
    /// follow-up control messages emitted by the accepted handlers, in drain
    /// order.
    ///
    /// Any failure discards the outputs accumulated from previously drained
    /// tasks in the same call.
    pub async fn run(&self, message: Option<SharedMessage>) -> Result<Vec<ControlMessage>> {
        let message = message.ok_or(Error::NullMessage)?;

        if !message.lock().await.has_task(ENGINE_TASK) {
            return Err(Error::NoEngineTask);
        }

        let mut output_messages = Vec::new();

        loop {
            let current_task = {
                let mut guard = message.lock().await;
                if !guard.has_task(ENGINE_TASK) {
                    break;
                }
                guard.remove_task(ENGINE_TASK)?
            };

            let task = parse_task(&current_task)?;
            debug!(task_type = %task.task_type, "draining llm_engine task");

            let context = Context::construct_root(task, message.clone());

            // Retire the scope on every exit path so pending input
            // resolvers observe failure instead of suspending forever.
            let executed = self.runner.execute(context.clone()).await;
            context.retire();
            executed?;

            let mut new_messages = self.handle_tasks(&context).await?;
            output_messages.append(&mut new_messages);
        }

        Ok(output_messages)
    }

    /// Consult the task-handler runners in registration order; the first
    /// defined result short-circuits the chain.
    async fn handle_tasks(&self, context: &Arc<Context>) -> Result<Vec<ControlMessage>> {
        for task_handler in &self.task_handlers {
            if let Some(new_tasks) = task_handler.try_handle(context).await? {
                return Ok(new_tasks);
            }
        }
        Err(Error::UnhandledOutputs)
    }
}

fn parse_task(current_task: &Value) -> Result<Task> {
    let task_type = current_task
        .get("task_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedTask("missing string 'task_type'".to_string()))?;
    let task_dict = current_task
        .get("task_dict")
        .filter(|dict| dict.is_object())
        .cloned()
        .ok_or_else(|| Error::MalformedTask("missing object 'task_dict'".to_string()))?;
    Ok(Task::new(task_type, task_dict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shared(message: ControlMessage) -> SharedMessage {
        Arc::new(tokio::sync::Mutex::new(message))
    }

    fn engine_message(task_dicts: &[Value]) -> SharedMessage {
        let mut message = ControlMessage::new();
        for dict in task_dicts {
            message.add_task(ENGINE_TASK, dict.clone()).unwrap();
        }
        shared(message)
    }

    /// Runner that publishes a fixed object on the root context.
    struct PublishNode {
        outputs: Value,
    }

    #[async_trait]
    impl Node for PublishNode {
        fn get_input_names(&self) -> Vec<String> {
            Vec::new()
        }

        async fn execute(&self, context: Arc<Context>) -> Result<()> {
            context.set_output(self.outputs.clone())?;
            context.outputs_complete()
        }
    }

    /// Runner that copies `count` out of the task dict into its outputs.
    struct CountNode;

    #[async_trait]
    impl Node for CountNode {
        fn get_input_names(&self) -> Vec<String> {
            Vec::new()
        }

        async fn execute(&self, context: Arc<Context>) -> Result<()> {
            let count = context.task().get("count").cloned().unwrap_or(json!(0));
            context.set_output_key("count", count)?;
            context.outputs_complete()
        }
    }

    /// Handler that echoes its single resolved input into a reply message.
    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        fn get_input_names(&self) -> Vec<String> {
            vec!["response".to_string()]
        }

        async fn try_handle(
            &self,
            context: Arc<Context>,
        ) -> Result<Option<Vec<ControlMessage>>> {
            let response = context.get_input().await?;
            let mut message = ControlMessage::new();
            message.set_metadata("reply", response);
            Ok(Some(vec![message]))
        }
    }

    /// Handler that emits one tagged message per resolved `count`.
    struct FanOutHandler;

    #[async_trait]
    impl TaskHandler for FanOutHandler {
        fn get_input_names(&self) -> Vec<String> {
            vec!["count".to_string()]
        }

        async fn try_handle(
            &self,
            context: Arc<Context>,
        ) -> Result<Option<Vec<ControlMessage>>> {
            let count = context.get_input().await?.as_u64().unwrap_or(0);
            let mut messages = Vec::new();
            for index in 0..count {
                let mut message = ControlMessage::new();
                message.set_metadata("index", json!(index));
                messages.push(message);
            }
            Ok(Some(messages))
        }
    }

    struct DecliningHandler {
        consulted: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler for DecliningHandler {
        fn get_input_names(&self) -> Vec<String> {
            Vec::new()
        }

        async fn try_handle(
            &self,
            _context: Arc<Context>,
        ) -> Result<Option<Vec<ControlMessage>>> {
            self.consulted.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct AcceptingHandler {
        consulted: Arc<AtomicUsize>,
        emit: usize,
    }

    #[async_trait]
    impl TaskHandler for AcceptingHandler {
        fn get_input_names(&self) -> Vec<String> {
            Vec::new()
        }

        async fn try_handle(
            &self,
            _context: Arc<Context>,
        ) -> Result<Option<Vec<ControlMessage>>> {
            self.consulted.fetch_add(1, Ordering::SeqCst);
            Ok(Some(vec![ControlMessage::new(); self.emit]))
        }
    }

    /// Runner that spawns a sibling awaiter and then fails before anything
    /// publishes.
    struct FailBeforePublishNode {
        waiter: std::sync::Mutex<Option<tokio::task::JoinHandle<Result<Value>>>>,
    }

    #[async_trait]
    impl Node for FailBeforePublishNode {
        fn get_input_names(&self) -> Vec<String> {
            Vec::new()
        }

        async fn execute(&self, context: Arc<Context>) -> Result<()> {
            let consumer =
                context.push("consumer", vec![InputBinding::new("producer", "producer")])?;
            let handle = tokio::spawn(async move { consumer.get_input().await });
            *self.waiter.lock().unwrap() = Some(handle);
            context.get_input().await.map(|_| ())
        }
    }

    /// Handler that succeeds until it sees a count of three, then trips an
    /// input-contract violation.
    struct FailOnThreeHandler;

    #[async_trait]
    impl TaskHandler for FailOnThreeHandler {
        fn get_input_names(&self) -> Vec<String> {
            vec!["count".to_string()]
        }

        async fn try_handle(
            &self,
            context: Arc<Context>,
        ) -> Result<Option<Vec<ControlMessage>>> {
            let count = context.get_input().await?.as_u64().unwrap_or(0);
            if count == 3 {
                context.get_input_named("missing").await?;
            }
            Ok(Some(vec![ControlMessage::new()]))
        }
    }

    #[tokio::test]
    async fn single_task_single_handler_round_trip() {
        let mut engine = LlmEngine::new(Arc::new(PublishNode {
            outputs: json!({"response": "ok"}),
        }));
        engine
            .add_task_handler(Vec::new(), Arc::new(EchoHandler))
            .unwrap();

        let message = engine_message(&[json!({
            "task_type": "inference",
            "task_dict": {"prompt": "hi"}
        })]);

        let outputs = engine.run(Some(message.clone())).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].get_metadata_key("reply").unwrap(), json!("ok"));
        assert!(!message.lock().await.has_task(ENGINE_TASK));
    }

    #[tokio::test]
    async fn first_accepting_handler_short_circuits_the_chain() {
        let consulted = Arc::new(AtomicUsize::new(0));
        let mut engine = LlmEngine::new(Arc::new(PublishNode { outputs: json!({}) }));
        engine
            .add_task_handler(
                Vec::new(),
                Arc::new(DecliningHandler {
                    consulted: consulted.clone(),
                }),
            )
            .unwrap();
        engine
            .add_task_handler(
                Vec::new(),
                Arc::new(AcceptingHandler {
                    consulted: consulted.clone(),
                    emit: 0,
                }),
            )
            .unwrap();
        engine
            .add_task_handler(
                Vec::new(),
                Arc::new(AcceptingHandler {
                    consulted: consulted.clone(),
                    emit: 3,
                }),
            )
            .unwrap();

        let message = engine_message(&[json!({"task_type": "inference", "task_dict": {}})]);
        let outputs = engine.run(Some(message)).await.unwrap();

        // The second handler accepted with an empty vector; the third was
        // never consulted.
        assert!(outputs.is_empty());
        assert_eq!(consulted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_fails_when_no_handler_accepts() {
        let consulted = Arc::new(AtomicUsize::new(0));
        let mut engine = LlmEngine::new(Arc::new(PublishNode { outputs: json!({}) }));
        for _ in 0..2 {
            engine
                .add_task_handler(
                    Vec::new(),
                    Arc::new(DecliningHandler {
                        consulted: consulted.clone(),
                    }),
                )
                .unwrap();
        }

        let message = engine_message(&[json!({"task_type": "inference", "task_dict": {}})]);
        let err = engine.run(Some(message)).await.unwrap_err();
        assert!(matches!(err, Error::UnhandledOutputs));
        assert_eq!(consulted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn multiple_drained_tasks_concatenate_in_drain_order() {
        let mut engine = LlmEngine::new(Arc::new(CountNode));
        engine
            .add_task_handler(Vec::new(), Arc::new(FanOutHandler))
            .unwrap();

        let message = engine_message(&[
            json!({"task_type": "inference", "task_dict": {"count": 2}}),
            json!({"task_type": "inference", "task_dict": {"count": 3}}),
        ]);

        let outputs = engine.run(Some(message)).await.unwrap();
        assert_eq!(outputs.len(), 5);
        let indices: Vec<Value> = outputs
            .iter()
            .map(|m| m.get_metadata_key("index").unwrap())
            .collect();
        assert_eq!(indices, vec![json!(0), json!(1), json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn run_without_a_message_fails() {
        let engine = LlmEngine::new(Arc::new(PublishNode { outputs: json!({}) }));
        let err = engine.run(None).await.unwrap_err();
        assert!(matches!(err, Error::NullMessage));
    }

    #[tokio::test]
    async fn run_without_an_engine_task_fails() {
        let engine = LlmEngine::new(Arc::new(PublishNode { outputs: json!({}) }));
        let mut message = ControlMessage::new();
        message.add_task("other", json!({})).unwrap();

        let err = engine.run(Some(shared(message))).await.unwrap_err();
        assert!(matches!(err, Error::NoEngineTask));
    }

    #[tokio::test]
    async fn malformed_drained_tasks_fail_the_run() {
        let engine = LlmEngine::new(Arc::new(PublishNode { outputs: json!({}) }));
        let message = engine_message(&[json!({"task_dict": {}})]);

        let err = engine.run(Some(message)).await.unwrap_err();
        assert!(matches!(err, Error::MalformedTask(_)));
    }

    #[tokio::test]
    async fn handler_failure_discards_earlier_outputs() {
        let mut engine = LlmEngine::new(Arc::new(CountNode));
        engine
            .add_task_handler(Vec::new(), Arc::new(FailOnThreeHandler))
            .unwrap();

        let message = engine_message(&[
            json!({"task_type": "inference", "task_dict": {"count": 2}}),
            json!({"task_type": "inference", "task_dict": {"count": 3}}),
        ]);

        // The first task succeeds; the second trips a contract violation and
        // the whole run surfaces the error instead of the partial outputs.
        let err = engine.run(Some(message)).await.unwrap_err();
        assert!(matches!(err, Error::UnknownInput(_)));
    }

    #[tokio::test]
    async fn execution_failure_retires_pending_sibling_awaiters() {
        let node = Arc::new(FailBeforePublishNode {
            waiter: std::sync::Mutex::new(None),
        });
        let engine = LlmEngine::new(node.clone());
        let message = engine_message(&[json!({"task_type": "inference", "task_dict": {}})]);

        // The root context declares no inputs, so the node's own get_input
        // fails after it has parked a sibling on a never-published output.
        let err = engine.run(Some(message)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArity(0)));

        let waiter = node.waiter.lock().unwrap().take().unwrap();
        let sibling_err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(sibling_err, Error::MissingInput(name) if name == "producer"));
    }

    #[tokio::test]
    async fn handler_registration_rejects_arity_mismatches() {
        let mut engine = LlmEngine::new(Arc::new(PublishNode { outputs: json!({}) }));
        let err = engine
            .add_task_handler(
                vec![
                    InputBinding::from_external("a"),
                    InputBinding::from_external("b"),
                ],
                Arc::new(EchoHandler),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InputArityMismatch { .. }));
    }
}

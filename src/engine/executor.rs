//! Task executor: one concurrent execution per task.
//!
//! # Execution loop
//! ```text
//! fetch task ──terminal──► stop
//!     │
//!     ▼
//! Working ─► assemble prompt ─► fit window ─► model call
//!                                               │
//!        ┌───────────────┬──────────────────────┼───────────────┐
//!        ▼               ▼                      ▼               ▼
//!    cancelled        error            "[INPUT_REQUIRED]"     answer
//!    Canceled         Failed            InputRequired        Completed
//!                                      wait for resume ─► fetch task
//! ```
//!
//! Errors inside the loop never cross the spawn boundary. They surface as
//! the task's terminal state, its `error` field, and a `state` stream event.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::prompt::render_turns;
use super::registry::{ResumeRegistry, ResumeSignal};
use super::window::{ContextWindow, Tokenizer};
use crate::llm::{ChatMessage, ChatRequest, ModelClient, ModelError};
use crate::stream::{StreamEvent, StreamSink};
use crate::task::{
    Artifact, Message, StoreError, Task, TaskId, TaskMutation, TaskState, TaskStore, TokenUsage,
};

/// Substring in a model reply that suspends the task until the caller resumes it.
pub const INPUT_REQUIRED_MARKER: &str = "[INPUT_REQUIRED]";

/// Filename of the artifact holding a completed task's answer.
pub const RESULT_FILENAME: &str = "result.txt";

/// Errors returned synchronously by the executor API.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task {0} is not waiting for input")]
    NotWaiting(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {0} already has a running execution")]
    AlreadyRunning(TaskId),

    #[error("task {0} is {1} and cannot be canceled")]
    NotCancelable(TaskId, TaskState),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ExecutorError::NotFound(id),
            other => ExecutorError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Model identifier sent with every request
    pub model: String,
    /// Prepended as a system message; empty disables it
    pub system_prompt: String,
    /// Context budget in tokens, 0 = unlimited
    pub max_context_tokens: usize,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    model: Arc<dyn ModelClient>,
    window: ContextWindow,
    settings: ExecutorSettings,
    registry: ResumeRegistry,
}

/// Runs tasks against a model, one execution per task at a time.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<Inner>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        model: Arc<dyn ModelClient>,
        settings: ExecutorSettings,
    ) -> Self {
        let tokenizer = Tokenizer::for_model(&settings.model);
        Self::with_tokenizer(store, model, settings, tokenizer)
    }

    pub fn with_tokenizer(
        store: Arc<dyn TaskStore>,
        model: Arc<dyn ModelClient>,
        settings: ExecutorSettings,
        tokenizer: Tokenizer,
    ) -> Self {
        let window = ContextWindow::new(settings.max_context_tokens, tokenizer);
        Self {
            inner: Arc::new(Inner {
                store,
                model,
                window,
                settings,
                registry: ResumeRegistry::new(),
            }),
        }
    }

    /// Start executing a task and return its join handle immediately.
    pub async fn execute(
        &self,
        task_id: TaskId,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, ExecutorError> {
        self.spawn(task_id, cancel, None).await
    }

    /// Like [`execute`](Self::execute), forwarding model output and state
    /// changes to `sink`.
    pub async fn execute_streaming(
        &self,
        task_id: TaskId,
        cancel: CancellationToken,
        sink: Arc<dyn StreamSink>,
    ) -> Result<JoinHandle<()>, ExecutorError> {
        self.spawn(task_id, cancel, Some(sink)).await
    }

    /// Wake a task suspended in `InputRequired`.
    pub async fn resume(&self, task_id: &TaskId) -> Result<(), ExecutorError> {
        let task = self.inner.store.get_task(task_id).await?;
        if task.state() != TaskState::InputRequired {
            return Err(ExecutorError::NotWaiting(task_id.clone()));
        }

        match self.inner.registry.resume(task_id) {
            ResumeSignal::Sent => {
                tracing::debug!(task_id = %task_id, "Resume signal sent");
                Ok(())
            }
            ResumeSignal::AlreadyPending => {
                tracing::warn!(task_id = %task_id, "Resume already pending, ignoring");
                Ok(())
            }
            ResumeSignal::NotRegistered => Err(ExecutorError::NotWaiting(task_id.clone())),
        }
    }

    /// Cancel a task.
    ///
    /// A running execution is signalled and records `Canceled` itself; an idle
    /// non-terminal task is moved to `Canceled` directly.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<(), ExecutorError> {
        let task = self.inner.store.get_task(task_id).await?;
        if task.state().is_terminal() {
            return Err(ExecutorError::NotCancelable(task_id.clone(), task.state()));
        }

        if self.inner.registry.cancel(task_id) {
            tracing::info!(task_id = %task_id, "Cancellation requested for running task");
            return Ok(());
        }

        match self
            .inner
            .store
            .set_state(task_id, TaskState::Canceled)
            .await
        {
            Ok(_) => {
                tracing::info!(task_id = %task_id, "Idle task canceled");
                Ok(())
            }
            Err(StoreError::Immutable(id, state)) => Err(ExecutorError::NotCancelable(id, state)),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the task has a live execution.
    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.inner.registry.is_registered(task_id)
    }

    async fn spawn(
        &self,
        task_id: TaskId,
        cancel: CancellationToken,
        sink: Option<Arc<dyn StreamSink>>,
    ) -> Result<JoinHandle<()>, ExecutorError> {
        self.inner.store.get_task(&task_id).await?;

        let cancel = cancel.child_token();
        let (registration, resume_rx) = self
            .inner
            .registry
            .register(task_id.clone(), cancel.clone())
            .ok_or_else(|| ExecutorError::AlreadyRunning(task_id.clone()))?;

        let execution = Execution {
            inner: Arc::clone(&self.inner),
            task_id,
            cancel,
            sink,
            resume_rx,
        };

        Ok(tokio::spawn(async move {
            let _registration = registration;
            execution.run().await;
        }))
    }
}

/// State of one spawned execution.
struct Execution {
    inner: Arc<Inner>,
    task_id: TaskId,
    cancel: CancellationToken,
    sink: Option<Arc<dyn StreamSink>>,
    resume_rx: mpsc::Receiver<()>,
}

/// What the loop does after a model reply has been committed.
enum Step {
    Suspend,
    Done,
}

impl Execution {
    async fn run(mut self) {
        tracing::info!(task_id = %self.task_id, "Execution started");

        loop {
            let task = match self.inner.store.get_task(&self.task_id).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(task_id = %self.task_id, error = %e, "Failed to load task, aborting execution");
                    return;
                }
            };

            if task.state().is_terminal() {
                tracing::debug!(task_id = %self.task_id, state = %task.state(), "Task already terminal");
                return;
            }
            if self.cancel.is_cancelled() {
                self.record_canceled().await;
                return;
            }
            if task.state() != TaskState::Working
                && self.transition(TaskState::Working).await.is_none()
            {
                return;
            }

            match self.step(&task).await {
                Some(Step::Suspend) => {
                    if !self.wait_for_resume().await {
                        return;
                    }
                }
                Some(Step::Done) | None => return,
            }
        }
    }

    /// One prompt/model round trip. `None` means the execution is over.
    async fn step(&mut self, task: &Task) -> Option<Step> {
        let turns = match render_turns(task.history()) {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "Task history rejected");
                self.record_failed(e.to_string()).await;
                return None;
            }
        };

        let settings = &self.inner.settings;
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if !settings.system_prompt.is_empty() {
            messages.push(ChatMessage::system(settings.system_prompt.clone()));
        }
        messages.extend(turns);
        let fit = self.inner.window.fit(messages);

        let request = ChatRequest {
            model: settings.model.clone(),
            messages: fit.messages,
        };
        tracing::debug!(
            task_id = %self.task_id,
            model = %request.model,
            prompt_tokens = fit.tokens,
            budget = self.inner.window.max_tokens(),
            "Invoking model"
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ModelError::cancelled()),
            result = self.inner.model.chat(&request, &self.cancel, self.sink.as_deref()) => result,
        };

        let completion = match result {
            Ok(_) | Err(_) if self.cancel.is_cancelled() => {
                self.record_canceled().await;
                return None;
            }
            Err(e) if e.is_cancellation() => {
                tracing::info!(task_id = %self.task_id, error = %e, "Model call cancelled");
                self.record_canceled().await;
                return None;
            }
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "Model call failed");
                self.record_failed(e.to_string()).await;
                return None;
            }
            Ok(completion) => completion,
        };

        let usage = completion.usage.unwrap_or_else(|| {
            TokenUsage::new(
                fit.tokens as u64,
                self.inner.window.count_text(&completion.content) as u64,
            )
        });
        let content = completion.content;

        if content.contains(INPUT_REQUIRED_MARKER) {
            // A resume that raced the previous suspension must not skip this one.
            while self.resume_rx.try_recv().is_ok() {}

            let mutation: TaskMutation = Box::new(move |task: &mut Task| -> Result<(), StoreError> {
                task.push_output(Message::assistant_text(content));
                task.record_usage(&usage);
                task.transition(TaskState::InputRequired)?;
                Ok(())
            });
            self.commit(mutation, TaskState::InputRequired, None)
                .await
                .map(|_| Step::Suspend)
        } else {
            let mutation = completion_mutation(content, usage, Uuid::new_v4().to_string());
            self.commit(mutation, TaskState::Completed, None)
                .await
                .map(|_| Step::Done)
        }
    }

    /// Block in `InputRequired`. Returns `true` when resumed.
    async fn wait_for_resume(&mut self) -> bool {
        tracing::info!(task_id = %self.task_id, "Waiting for input");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.record_canceled().await;
                false
            }
            signal = self.resume_rx.recv() => match signal {
                Some(()) => {
                    tracing::info!(task_id = %self.task_id, "Resumed");
                    true
                }
                None => {
                    tracing::warn!(task_id = %self.task_id, "Resume channel closed");
                    false
                }
            },
        }
    }

    async fn transition(&self, state: TaskState) -> Option<Task> {
        self.commit(
            Box::new(move |task: &mut Task| task.transition(state).map_err(StoreError::from)),
            state,
            None,
        )
        .await
    }

    async fn record_canceled(&self) {
        self.transition(TaskState::Canceled).await;
    }

    async fn record_failed(&self, error: String) {
        let message = error.clone();
        self.commit(
            Box::new(move |task: &mut Task| task.fail(message).map_err(StoreError::from)),
            TaskState::Failed,
            Some(error),
        )
        .await;
    }

    /// Apply a mutation that ends in `state` and announce the new state.
    async fn commit(
        &self,
        mutation: TaskMutation,
        state: TaskState,
        error: Option<String>,
    ) -> Option<Task> {
        match self.inner.store.update_task(&self.task_id, mutation).await {
            Ok(task) => {
                tracing::info!(task_id = %self.task_id, state = %state, "Task state changed");
                self.emit(StreamEvent::State {
                    status: state,
                    error,
                })
                .await;
                Some(task)
            }
            Err(e) => {
                tracing::error!(
                    task_id = %self.task_id,
                    target_state = %state,
                    error = %e,
                    "Failed to update task"
                );
                None
            }
        }
    }

    /// Deliver an event unless the sink stays full after cancellation.
    async fn emit(&self, event: StreamEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        tokio::select! {
            biased;
            _ = sink.send(event) => {}
            _ = self.cancel.cancelled() => {
                tracing::debug!(task_id = %self.task_id, "Sink not draining, dropped event");
            }
        }
    }
}

/// Store the answer, its usage and its artifact, then complete the task.
fn completion_mutation(content: String, usage: TokenUsage, artifact_id: String) -> TaskMutation {
    Box::new(move |task: &mut Task| -> Result<(), StoreError> {
        let artifact = Artifact::text(RESULT_FILENAME, &content);
        task.push_output(Message::assistant_text(content));
        task.record_usage(&usage);
        if !task.insert_artifact(artifact_id.clone(), artifact) {
            return Err(StoreError::DuplicateArtifact {
                task_id: task.id().clone(),
                artifact_id,
            });
        }
        task.transition(TaskState::Completed)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::llm::scripted::{ScriptedModelClient, ScriptedReply};
    use crate::stream::ChannelSink;
    use crate::task::{InMemoryTaskStore, Part, Role};

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        model: Arc<ScriptedModelClient>,
        executor: TaskExecutor,
    }

    fn harness_with(model: ScriptedModelClient, max_context_tokens: usize) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let model = Arc::new(model);
        let executor = TaskExecutor::with_tokenizer(
            store.clone(),
            model.clone(),
            ExecutorSettings {
                model: "test-model".into(),
                system_prompt: "You are a test agent.".into(),
                max_context_tokens,
            },
            Tokenizer::Bytes,
        );
        Harness {
            store,
            model,
            executor,
        }
    }

    fn harness(model: ScriptedModelClient) -> Harness {
        harness_with(model, 0)
    }

    impl Harness {
        async fn submit(&self, text: &str) -> TaskId {
            let id = TaskId::new();
            self.store
                .create_task(Task::new(id.clone(), vec![Message::user_text(text)]))
                .await
                .unwrap();
            id
        }

        async fn wait_for(&self, id: &TaskId, state: TaskState) -> Task {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                let task = self.store.get_task(id).await.unwrap();
                if task.state() == state {
                    return task;
                }
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for {}, task is {}",
                    state,
                    task.state()
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn states(events: &[StreamEvent]) -> Vec<TaskState> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::State { status, .. } => Some(*status),
                StreamEvent::Delta(_) => None,
            })
            .collect()
    }

    fn outputs(task: &Task) -> Vec<String> {
        task.output().iter().map(|m| m.text()).collect()
    }

    #[tokio::test]
    async fn test_simple_completion() {
        let h = harness(ScriptedModelClient::texts(["hi there"]));
        let id = h.submit("hello").await;
        let (sink, mut rx) = ChannelSink::channel(32);

        h.executor
            .execute_streaming(id.clone(), CancellationToken::new(), Arc::new(sink))
            .await
            .unwrap()
            .await
            .unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(outputs(&task), vec!["hi there"]);
        assert!(task.output().iter().all(|m| m.role == Role::Assistant));
        assert!(task.error().is_none());

        let artifacts: Vec<_> = task.artifacts().values().collect();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].mime_type, "text/plain");
        assert_eq!(artifacts[0].filename, RESULT_FILENAME);
        assert_eq!(artifacts[0].data, b"hi there".to_vec());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            states(&events),
            vec![TaskState::Working, TaskState::Completed]
        );
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "hi there");

        assert!(!h.executor.is_running(&id));
    }

    #[tokio::test]
    async fn test_input_required_then_resume() {
        let h = harness(ScriptedModelClient::texts([
            "please provide X [INPUT_REQUIRED]",
            "done",
        ]));
        let id = h.submit("do the thing").await;
        let handle = h
            .executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap();

        let waiting = h.wait_for(&id, TaskState::InputRequired).await;
        assert_eq!(outputs(&waiting), vec!["please provide X [INPUT_REQUIRED]"]);
        assert!(h.executor.is_running(&id));

        h.executor.resume(&id).await.unwrap();
        handle.await.unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(
            outputs(&task),
            vec!["please provide X [INPUT_REQUIRED]", "done"]
        );
        assert_eq!(task.artifacts().len(), 1);
        assert_eq!(h.model.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_input() {
        let h = harness(ScriptedModelClient::texts(["need more [INPUT_REQUIRED]"]));
        let id = h.submit("start").await;
        let cancel = CancellationToken::new();
        let handle = h.executor.execute(id.clone(), cancel.clone()).await.unwrap();

        h.wait_for(&id, TaskState::InputRequired).await;
        cancel.cancel();
        handle.await.unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.state(), TaskState::Canceled);
        assert!(task.error().is_none());
        assert!(task.artifacts().is_empty());
        assert!(!h.executor.is_running(&id));
    }

    #[tokio::test]
    async fn test_undrained_sink_does_not_block_cancel() {
        let h = harness(ScriptedModelClient::texts(["a long answer"]));
        let id = h.submit("start").await;
        let (sink, _events) = ChannelSink::channel(1);
        let handle = h
            .executor
            .execute_streaming(id.clone(), CancellationToken::new(), Arc::new(sink))
            .await
            .unwrap();

        // The `working` event fills the only slot and nobody reads it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.executor.cancel(&id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("execution stuck on a full sink")
            .unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.state(), TaskState::Canceled);
        assert!(!h.executor.is_running(&id));
    }

    #[test]
    fn test_completion_never_replaces_an_artifact() {
        let mut task = Task::new(TaskId::from("t-1"), vec![Message::user_text("q")]);
        task.transition(TaskState::Working).unwrap();
        assert!(task.insert_artifact("a-1".into(), Artifact::text("old.txt", "old")));

        let mutation = completion_mutation("new".into(), TokenUsage::new(1, 1), "a-1".into());
        let err = mutation(&mut task).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DuplicateArtifact { ref artifact_id, .. } if artifact_id == "a-1"
        ));
        assert_eq!(task.artifacts()["a-1"].filename, "old.txt");
    }

    #[tokio::test]
    async fn test_model_error_fails_task() {
        let h = harness(ScriptedModelClient::new([ScriptedReply::Error(
            ModelError::server_error(500, "stub exploded".into()),
        )]));
        let id = h.submit("hello").await;
        let (sink, mut rx) = ChannelSink::channel(32);
        h.executor
            .execute_streaming(id.clone(), CancellationToken::new(), Arc::new(sink))
            .await
            .unwrap()
            .await
            .unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        let expected = ModelError::server_error(500, "stub exploded".into()).to_string();
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.error(), Some(expected.as_str()));
        assert!(task.artifacts().is_empty());
        assert!(task.output().is_empty());

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(StreamEvent::State {
                status: TaskState::Failed,
                error: Some(expected),
            })
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_cancellation() {
        let h = harness(ScriptedModelClient::new([ScriptedReply::Error(
            ModelError::timeout("deadline exceeded".into()),
        )]));
        let id = h.submit("hello").await;
        h.executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap()
            .await
            .unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.state(), TaskState::Canceled);
        assert!(task.error().is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_model_call() {
        let h = harness(ScriptedModelClient::new([ScriptedReply::WaitForCancel]));
        let id = h.submit("hello").await;
        let handle = h
            .executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap();

        h.wait_for(&id, TaskState::Working).await;
        h.executor.cancel(&id).await.unwrap();
        handle.await.unwrap();

        assert_eq!(
            h.store.get_task(&id).await.unwrap().state(),
            TaskState::Canceled
        );
    }

    #[tokio::test]
    async fn test_validation_failure_fails_task() {
        let h = harness(ScriptedModelClient::texts(["unused"]));
        let id = TaskId::new();
        h.store
            .create_task(Task::new(
                id.clone(),
                vec![Message::new(
                    Role::User,
                    vec![Part::file_uri("http://example.com/x.txt", "text/plain")],
                )],
            ))
            .await
            .unwrap();

        h.executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap()
            .await
            .unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.error().unwrap().contains("http://example.com/x.txt"));
        assert!(h.model.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resume_on_task_not_waiting() {
        let h = harness(ScriptedModelClient::texts(["answer"]));
        let id = h.submit("hello").await;

        let before = h.store.get_task(&id).await.unwrap();
        let err = h.executor.resume(&id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotWaiting(_)));
        let after = h.store.get_task(&id).await.unwrap();
        assert_eq!(after.state(), before.state());
        assert_eq!(after.updated_at(), before.updated_at());

        h.executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap()
            .await
            .unwrap();
        let err = h.executor.resume(&id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotWaiting(_)));
        assert_eq!(outputs(&h.store.get_task(&id).await.unwrap()), vec!["answer"]);

        let err = h.executor.resume(&TaskId::from("nope")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_repeated_resume_is_harmless() {
        let h = harness(ScriptedModelClient::texts(["which one? [INPUT_REQUIRED]", "ok"]));
        let id = h.submit("pick").await;
        let handle = h
            .executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap();

        h.wait_for(&id, TaskState::InputRequired).await;
        h.executor.resume(&id).await.unwrap();
        match h.executor.resume(&id).await {
            Ok(()) | Err(ExecutorError::NotWaiting(_)) => {}
            Err(e) => panic!("unexpected: {e}"),
        }
        handle.await.unwrap();

        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(h.model.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_execute_rejected() {
        let h = harness(ScriptedModelClient::new([ScriptedReply::WaitForCancel]));
        let id = h.submit("hello").await;
        let cancel = CancellationToken::new();
        let handle = h.executor.execute(id.clone(), cancel.clone()).await.unwrap();

        let err = h
            .executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyRunning(_)));

        cancel.cancel();
        handle.await.unwrap();
        assert!(!h.executor.is_running(&id));

        let err = h
            .executor
            .execute(TaskId::from("missing"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_aborted_execution_releases_registration() {
        let h = harness(ScriptedModelClient::new([ScriptedReply::WaitForCancel]));
        let id = h.submit("hello").await;
        let handle = h
            .executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap();

        h.wait_for(&id, TaskState::Working).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!h.executor.is_running(&id));
    }

    #[tokio::test]
    async fn test_cancel_idle_and_terminal_tasks() {
        let h = harness(ScriptedModelClient::default());
        let id = h.submit("never run").await;

        h.executor.cancel(&id).await.unwrap();
        assert_eq!(
            h.store.get_task(&id).await.unwrap().state(),
            TaskState::Canceled
        );

        let err = h.executor.cancel(&id).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::NotCancelable(_, TaskState::Canceled)
        ));

        // Executing a terminal task is a no-op.
        h.executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(h.model.requests().is_empty());

        let err = h.executor.cancel(&TaskId::from("nope")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token() {
        let h = harness(ScriptedModelClient::texts(["unused"]));
        let id = h.submit("hello").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        h.executor
            .execute(id.clone(), cancel)
            .await
            .unwrap()
            .await
            .unwrap();

        assert_eq!(
            h.store.get_task(&id).await.unwrap().state(),
            TaskState::Canceled
        );
        assert!(h.model.requests().is_empty());
    }

    #[tokio::test]
    async fn test_request_shape_and_usage() {
        let h = harness(ScriptedModelClient::texts(["first [INPUT_REQUIRED]", "two words"]));
        let id = h.submit("question").await;
        let handle = h
            .executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap();

        h.wait_for(&id, TaskState::InputRequired).await;
        // Callers replay the assistant turn and their reply into the input history.
        h.store
            .update_task(
                &id,
                Box::new(|task: &mut Task| -> Result<(), StoreError> {
                    task.push_input(Message::assistant_text("first [INPUT_REQUIRED]"));
                    task.push_input(Message::user_text("answer"));
                    Ok(())
                }),
            )
            .await
            .unwrap();
        h.executor.resume(&id).await.unwrap();
        handle.await.unwrap();

        let requests = h.model.requests();
        assert_eq!(requests[0].model, "test-model");
        assert_eq!(requests[0].messages[0], ChatMessage::system("You are a test agent."));
        assert_eq!(requests[0].flattened_prompt(), "question");
        assert_eq!(
            requests[1].flattened_prompt(),
            "question\n\n---\n\nfirst [INPUT_REQUIRED]\n\n---\n\nanswer"
        );

        // Scripted usage: 10 prompt tokens per call, completion = word count.
        let task = h.store.get_task(&id).await.unwrap();
        assert_eq!(task.usage(), TokenUsage::new(20, 4));
    }

    #[tokio::test]
    async fn test_context_window_applied() {
        // System prompt is 21 bytes; budget leaves room for it and one short turn.
        let h = harness_with(ScriptedModelClient::texts(["ok"]), 30);
        let id = TaskId::new();
        h.store
            .create_task(Task::new(
                id.clone(),
                vec![Message::user_text("short"), Message::user_text("x".repeat(100))],
            ))
            .await
            .unwrap();

        h.executor
            .execute(id.clone(), CancellationToken::new())
            .await
            .unwrap()
            .await
            .unwrap();

        let requests = h.model.requests();
        assert_eq!(
            requests[0].messages,
            vec![
                ChatMessage::system("You are a test agent."),
                ChatMessage::user("short")
            ]
        );
    }

    /// Drives random model replies, resumes and cancellations through the
    /// executor and checks every observed state change is a legal edge.
    #[tokio::test]
    async fn test_random_event_sequences_follow_state_machine() {
        let mut rng = StdRng::seed_from_u64(0xA2A);

        for round in 0..200 {
            let script_len = rng.gen_range(0..6);
            let mut script: Vec<ScriptedReply> = (0..script_len)
                .map(|_| match rng.gen_range(0..10) {
                    0..=5 => ScriptedReply::Text("tell me more [INPUT_REQUIRED]".into()),
                    6..=7 => ScriptedReply::Error(ModelError::client_error(400, "bad".into())),
                    _ => ScriptedReply::Text("final".into()),
                })
                .collect();
            script.push(ScriptedReply::Text("final".into()));

            let h = harness(ScriptedModelClient::new(script));
            let id = h.submit("go").await;
            let cancel = CancellationToken::new();
            let (sink, mut rx) = ChannelSink::channel(64);
            let handle = h
                .executor
                .execute_streaming(id.clone(), cancel.clone(), Arc::new(sink))
                .await
                .unwrap();

            let mut observed = vec![TaskState::Submitted];
            let mut cancelled = false;
            while let Some(event) = rx.recv().await {
                let StreamEvent::State { status, .. } = event else {
                    continue;
                };
                observed.push(status);
                match status {
                    TaskState::Working if !cancelled && rng.gen_bool(0.1) => {
                        cancel.cancel();
                        cancelled = true;
                    }
                    // Once cancelled the task may leave InputRequired at any moment.
                    TaskState::InputRequired if !cancelled => match rng.gen_range(0..10) {
                        0 => {
                            cancel.cancel();
                            cancelled = true;
                        }
                        1 => {
                            h.executor.cancel(&id).await.unwrap();
                            cancelled = true;
                        }
                        _ => h.executor.resume(&id).await.unwrap(),
                    },
                    s if s.is_terminal() => break,
                    _ => {}
                }
            }
            handle.await.unwrap();

            for pair in observed.windows(2) {
                assert!(
                    pair[0].can_transition_to(pair[1]),
                    "round {round}: illegal edge {} -> {} in {:?}",
                    pair[0],
                    pair[1],
                    observed
                );
            }
            let task = h.store.get_task(&id).await.unwrap();
            let last = *observed.last().unwrap();
            assert!(last.is_terminal(), "round {round}: {:?}", observed);
            assert_eq!(task.state(), last);
            assert_eq!(task.error().is_some(), last == TaskState::Failed);
            assert_eq!(task.artifacts().len(), usize::from(last == TaskState::Completed));
        }
    }
}

//! a2a-runtime - command-line entry point
//!
//! Runs a single task to completion, asking on stdin whenever the model
//! needs more input.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use a2a_runtime::config::Config;
use a2a_runtime::engine::TaskExecutor;
use a2a_runtime::llm::OpenAiCompatibleClient;
use a2a_runtime::stream::{ChannelSink, StreamEvent};
use a2a_runtime::task::{
    InMemoryTaskStore, Message, StoreError, Task, TaskId, TaskState, TaskStore,
};
use a2a_runtime::util::preview;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only model output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "a2a_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("usage: a2a-runtime <prompt...>");
    }

    let config = Config::from_env()?;
    info!(
        model = %config.default_model,
        base_url = %config.base_url,
        stream = config.stream_output,
        "Loaded configuration"
    );

    let client = OpenAiCompatibleClient::new(
        config.base_url.clone(),
        config.api_key.clone(),
        config.request_timeout,
    )?
    .with_retry_config(config.retry_config());
    let store = Arc::new(InMemoryTaskStore::new());
    let executor = TaskExecutor::new(store.clone(), Arc::new(client), config.executor_settings());

    let task_id = TaskId::new();
    store
        .create_task(Task::new(task_id.clone(), vec![Message::user_text(prompt)]))
        .await?;
    info!(task_id = %task_id, "Task submitted");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling task");
                cancel.cancel();
            }
        });
    }

    let mut driver = if config.stream_output {
        let (sink, events) = ChannelSink::channel(256);
        let handle = executor
            .execute_streaming(task_id.clone(), cancel.clone(), Arc::new(sink))
            .await?;
        Driver {
            store: store.clone(),
            task_id: task_id.clone(),
            events: Some(events),
            seen_outputs: 0,
            handle,
        }
    } else {
        let handle = executor.execute(task_id.clone(), cancel.clone()).await?;
        Driver {
            store: store.clone(),
            task_id: task_id.clone(),
            events: None,
            seen_outputs: 0,
            handle,
        }
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let state = driver.next_stop().await?;
        if state.is_terminal() {
            break;
        }

        let Some(reply) = read_reply(&mut stdin, &cancel).await? else {
            cancel.cancel();
            continue;
        };
        let question = store
            .get_task(&task_id)
            .await?
            .output()
            .last()
            .map(|m| m.text())
            .unwrap_or_default();
        store
            .update_task(
                &task_id,
                Box::new(move |task: &mut Task| -> Result<(), StoreError> {
                    task.push_input(Message::assistant_text(question));
                    task.push_input(Message::user_text(reply));
                    Ok(())
                }),
            )
            .await?;
        executor.resume(&task_id).await?;
    }

    driver.handle.await?;
    print_summary(&store.get_task(&task_id).await?)
}

/// Follows one execution until it needs input or ends.
struct Driver {
    store: Arc<InMemoryTaskStore>,
    task_id: TaskId,
    /// Present in streaming mode
    events: Option<mpsc::Receiver<StreamEvent>>,
    seen_outputs: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Driver {
    /// Wait for the next `input-required` or terminal state.
    async fn next_stop(&mut self) -> anyhow::Result<TaskState> {
        if let Some(events) = self.events.as_mut() {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Delta(text) => {
                        print!("{}", text);
                        std::io::stdout().flush()?;
                    }
                    StreamEvent::State { status, .. }
                        if status == TaskState::InputRequired || status.is_terminal() =>
                    {
                        println!();
                        return Ok(status);
                    }
                    StreamEvent::State { .. } => {}
                }
            }
            // Sink dropped without a terminal event: the execution aborted.
            return Ok(self.store.get_task(&self.task_id).await?.state());
        }

        loop {
            let task = self.store.get_task(&self.task_id).await?;
            let fresh_output = task.output().len() > self.seen_outputs;
            let stopped = task.state().is_terminal()
                || (task.state() == TaskState::InputRequired && fresh_output);
            if stopped || self.handle.is_finished() {
                for message in &task.output()[self.seen_outputs..] {
                    println!("{}", message.text());
                }
                self.seen_outputs = task.output().len();
                return Ok(task.state());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Read the user's reply. `None` on end of input or interrupt.
async fn read_reply(
    stdin: &mut Lines<BufReader<Stdin>>,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<String>> {
    print!("> ");
    std::io::stdout().flush()?;
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        line = stdin.next_line() => Ok(line?),
    }
}

fn print_summary(task: &Task) -> anyhow::Result<()> {
    eprintln!("state: {}", task.state());
    let usage = task.usage();
    eprintln!(
        "tokens: {} prompt + {} completion = {}",
        usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
    );
    for (id, artifact) in task.artifacts() {
        eprintln!(
            "artifact {}: {} ({}, {} bytes) {}",
            id,
            artifact.filename,
            artifact.mime_type,
            artifact.data.len(),
            preview(&String::from_utf8_lossy(&artifact.data), 60)
        );
    }
    if let Some(error) = task.error() {
        anyhow::bail!("task failed: {}", error);
    }
    Ok(())
}

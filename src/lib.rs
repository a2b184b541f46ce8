//! # A2A Runtime
//!
//! Task execution engine for agent-to-agent (A2A) runtimes.
//!
//! This library provides:
//! - A task model with an explicit lifecycle state machine
//! - An executor that runs each task as a cancellable, resumable tokio task
//! - Prompt assembly and context window management for the model call
//! - An OpenAI-compatible model client with SSE streaming
//!
//! ## Architecture
//!
//! ```text
//!   caller ──execute / resume / cancel──► TaskExecutor ──► StreamSink
//!                                              │
//!                        ┌─────────────────────┼─────────────────────┐
//!                        ▼                     ▼                     ▼
//!                   TaskStore        prompt + ContextWindow      ModelClient
//! ```
//!
//! ## Task Flow
//! 1. Caller stores a submitted task and calls `execute`
//! 2. Executor renders the history, fits it to the token budget, calls the model
//! 3. A reply containing `[INPUT_REQUIRED]` suspends the task until `resume`
//! 4. Any other reply completes the task and is stored as a text artifact
//!
//! ## Modules
//! - `task`: task types, lifecycle states, store contract
//! - `engine`: executor, prompt assembly, context window
//! - `llm`: model client trait and OpenAI-compatible client
//! - `stream`: streaming events and sinks

pub mod config;
pub mod engine;
pub mod llm;
pub mod stream;
pub mod task;
pub mod util;

pub use config::Config;
pub use engine::{ExecutorError, TaskExecutor};
pub use task::{InMemoryTaskStore, Task, TaskId, TaskState, TaskStore};

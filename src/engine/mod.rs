//! Task execution engine.
//!
//! - `prompt`: history → prompt text, with validation
//! - `window`: token budget enforcement
//! - `registry`: running executions (resume and cancel handles)
//! - `executor`: the execution loop and its public API

mod executor;
mod prompt;
mod registry;
mod window;

pub use executor::{
    ExecutorError, ExecutorSettings, TaskExecutor, INPUT_REQUIRED_MARKER, RESULT_FILENAME,
};
pub use prompt::{assemble_prompt, render_turns, ValidationError};
pub use window::{ContextWindow, Tokenizer, WindowFit};

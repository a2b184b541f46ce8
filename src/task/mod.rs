//! Task module - defines tasks, their lifecycle, and the store contract.
//!
//! - All states and part kinds are algebraic data types with exhaustive matching
//! - Invariants are documented on the types and enforced by their methods
//! - Storage is behind the [`TaskStore`] trait; [`InMemoryTaskStore`] is the reference backend

mod memory;
mod state;
mod store;
#[allow(clippy::module_inception)]
mod task;

pub use memory::InMemoryTaskStore;
pub use state::{InvalidTransition, TaskState};
pub use store::{StoreError, TaskMutation, TaskStore};
pub use task::{now_string, Artifact, FileRef, Message, Part, Role, Task, TaskId, TokenUsage};

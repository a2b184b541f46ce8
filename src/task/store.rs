//! Task store contract consumed by the executor.

use async_trait::async_trait;
use thiserror::Error;

use super::state::{InvalidTransition, TaskState};
use super::task::{Artifact, Task, TaskId};

/// Errors from a task store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("task {0} is {1} and can no longer be modified")]
    Immutable(TaskId, TaskState),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("artifact {artifact_id} already exists on task {task_id}")]
    DuplicateArtifact { task_id: TaskId, artifact_id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read-modify-write closure applied by [`TaskStore::update_task`].
///
/// Runs against a copy of the task; the copy is committed only if it returns `Ok`.
pub type TaskMutation = Box<dyn FnOnce(&mut Task) -> Result<(), StoreError> + Send>;

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails if the ID is taken.
    async fn create_task(&self, task: Task) -> Result<(), StoreError>;

    /// Get a task by ID.
    async fn get_task(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Atomically apply `mutation` and return the committed task.
    ///
    /// Terminal tasks are rejected with [`StoreError::Immutable`].
    async fn update_task(&self, id: &TaskId, mutation: TaskMutation) -> Result<Task, StoreError>;

    /// Move a task to `state`, validating the edge.
    async fn set_state(&self, id: &TaskId, state: TaskState) -> Result<Task, StoreError> {
        self.update_task(
            id,
            Box::new(move |task: &mut Task| task.transition(state).map_err(StoreError::from)),
        )
        .await
    }

    /// Attach an artifact to a task.
    async fn add_artifact(
        &self,
        id: &TaskId,
        artifact_id: String,
        artifact: Artifact,
    ) -> Result<Task, StoreError> {
        let task_id = id.clone();
        self.update_task(
            id,
            Box::new(move |task: &mut Task| {
                if task.insert_artifact(artifact_id.clone(), artifact) {
                    Ok(())
                } else {
                    Err(StoreError::DuplicateArtifact {
                        task_id,
                        artifact_id,
                    })
                }
            }),
        )
        .await
    }
}

//! In-memory task store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::{StoreError, TaskMutation, TaskStore};
use super::task::{Task, TaskId};

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tasks, most recently updated first.
    pub async fn list_tasks(&self, limit: usize, offset: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.updated_at().cmp(a.updated_at()));
        tasks.into_iter().skip(offset).take(limit).collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(task.id()) {
            return Err(StoreError::AlreadyExists(task.id().clone()));
        }
        tasks.insert(task.id().clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_task(&self, id: &TaskId, mutation: TaskMutation) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if current.state().is_terminal() {
            return Err(StoreError::Immutable(id.clone(), current.state()));
        }

        let mut draft = current.clone();
        mutation(&mut draft)?;
        *current = draft.clone();
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Artifact, Message, TaskState};

    async fn store_with_task(id: &str) -> (InMemoryTaskStore, TaskId) {
        let store = InMemoryTaskStore::new();
        let id = TaskId::from(id);
        store
            .create_task(Task::new(id.clone(), vec![Message::user_text("hello")]))
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let (store, id) = store_with_task("dup").await;
        let err = store
            .create_task(Task::new(id.clone(), vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(ref e) if *e == id));
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let store = InMemoryTaskStore::new();
        let err = store.get_task(&TaskId::from("missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_committed() {
        let (store, id) = store_with_task("rollback").await;
        let err = store
            .update_task(
                &id,
                Box::new(|task: &mut Task| -> Result<(), StoreError> {
                    task.push_output(Message::assistant_text("partial"));
                    Err(StoreError::Unavailable("disk full".into()))
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.get_task(&id).await.unwrap().output().is_empty());
    }

    #[tokio::test]
    async fn test_set_state_validates_edges() {
        let (store, id) = store_with_task("edges").await;
        let err = store.set_state(&id, TaskState::Completed).await.unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));

        let task = store.set_state(&id, TaskState::Working).await.unwrap();
        assert_eq!(task.state(), TaskState::Working);
    }

    #[tokio::test]
    async fn test_terminal_task_is_immutable() {
        let (store, id) = store_with_task("terminal").await;
        store.set_state(&id, TaskState::Canceled).await.unwrap();

        let err = store
            .update_task(
                &id,
                Box::new(|task: &mut Task| -> Result<(), StoreError> {
                    task.push_output(Message::assistant_text("late"));
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Immutable(_, TaskState::Canceled)));

        let err = store
            .add_artifact(&id, "a".into(), Artifact::text("a.txt", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Immutable(_, _)));
    }

    #[tokio::test]
    async fn test_duplicate_artifact_rejected() {
        let (store, id) = store_with_task("artifacts").await;
        store
            .add_artifact(&id, "a".into(), Artifact::text("a.txt", "x"))
            .await
            .unwrap();
        let err = store
            .add_artifact(&id, "a".into(), Artifact::text("a.txt", "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateArtifact { .. }));
    }

    #[tokio::test]
    async fn test_list_tasks_pages() {
        let store = InMemoryTaskStore::new();
        for i in 0..5 {
            store
                .create_task(Task::new(TaskId::from(format!("t-{i}")), vec![]))
                .await
                .unwrap();
        }
        assert_eq!(store.list_tasks(10, 0).await.len(), 5);
        assert_eq!(store.list_tasks(2, 4).await.len(), 1);
    }
}

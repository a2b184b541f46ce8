//! Registry of running executions, keyed by task ID.
//!
//! Holds the resume sender and cancellation token of each execution. Entries
//! are created when an execution starts and removed when its [`Registration`]
//! guard is dropped, which happens on normal exit, panic, or abort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::task::TaskId;

struct Entry {
    generation: u64,
    resume_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    next_generation: u64,
    entries: HashMap<TaskId, Entry>,
}

/// Outcome of a resume signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSignal {
    Sent,
    /// A signal is already pending; this one was dropped
    AlreadyPending,
    /// No live execution for the task
    NotRegistered,
}

#[derive(Clone, Default)]
pub struct ResumeRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ResumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Entries stay consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new execution. Returns `None` if the task already has one.
    pub fn register(
        &self,
        task_id: TaskId,
        cancel: CancellationToken,
    ) -> Option<(Registration, mpsc::Receiver<()>)> {
        let mut state = self.lock();
        if state.entries.contains_key(&task_id) {
            return None;
        }
        let generation = state.next_generation;
        state.next_generation += 1;

        let (resume_tx, resume_rx) = mpsc::channel(1);
        state.entries.insert(
            task_id.clone(),
            Entry {
                generation,
                resume_tx,
                cancel,
            },
        );
        let registration = Registration {
            registry: self.clone(),
            task_id,
            generation,
        };
        Some((registration, resume_rx))
    }

    pub fn is_registered(&self, task_id: &TaskId) -> bool {
        self.lock().entries.contains_key(task_id)
    }

    /// Send a non-blocking resume signal.
    pub fn resume(&self, task_id: &TaskId) -> ResumeSignal {
        let state = self.lock();
        let Some(entry) = state.entries.get(task_id) else {
            return ResumeSignal::NotRegistered;
        };
        match entry.resume_tx.try_send(()) {
            Ok(()) => ResumeSignal::Sent,
            Err(TrySendError::Full(())) => ResumeSignal::AlreadyPending,
            Err(TrySendError::Closed(())) => ResumeSignal::NotRegistered,
        }
    }

    /// Cancel the task's execution. Returns `false` if it has none.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.lock().entries.get(task_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, task_id: &TaskId, generation: u64) {
        let mut state = self.lock();
        if state
            .entries
            .get(task_id)
            .is_some_and(|e| e.generation == generation)
        {
            state.entries.remove(task_id);
        }
    }
}

/// Drop guard owned by a running execution.
pub struct Registration {
    registry: ResumeRegistry,
    task_id: TaskId,
    generation: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.task_id, self.generation);
        tracing::debug!(task_id = %self.task_id, "Execution unregistered");
    }
}

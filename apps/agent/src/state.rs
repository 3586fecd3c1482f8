// [apps/agent/src/state.rs]
//! The agent's view of its own work: at most one running task, plus the
//! completions still waiting for a server ACK.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::watch;
use uuid::Uuid;

/// What the agent reports in `current_task_status` / `state_sync_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Running,
    /// Cracker finished; crack batches or the completion ACK still draining.
    Completing,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Idle => "idle",
            TaskPhase::Running => "running",
            TaskPhase::Completing => "completing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub phase: TaskPhase,
    /// Flipping this to true tells the executor to kill the cracker.
    pub stop_signal: watch::Sender<bool>,
}

#[derive(Default)]
struct BoardInner {
    active: Option<ActiveTask>,
    /// Tasks whose completion the server has not ACKed yet; re-announced in
    /// every state sync until the ACK lands.
    pending_completions: HashSet<Uuid>,
}

/// Mutex-protected task board shared by the session, router and executor.
#[derive(Default)]
pub struct TaskBoard {
    inner: Mutex<BoardInner>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the board for a new task. Refuses while another task is live;
    /// the server should never double-assign, but a reconnect race can try.
    pub fn start_task(&self, task_id: Uuid, job_id: Uuid) -> Result<watch::Receiver<bool>, Uuid> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = &inner.active {
            return Err(active.task_id);
        }
        let (stop_sender, stop_receiver) = watch::channel(false);
        inner.active = Some(ActiveTask {
            task_id,
            job_id,
            phase: TaskPhase::Running,
            stop_signal: stop_sender,
        });
        Ok(stop_receiver)
    }

    pub fn mark_completing(&self, task_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = inner.active.as_mut() {
            if active.task_id == task_id {
                active.phase = TaskPhase::Completing;
            }
        }
    }

    /// Releases the board and remembers the task as awaiting its ACK.
    pub fn finish_task(&self, task_id: Uuid, awaiting_ack: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.active.as_ref().map(|active| active.task_id) == Some(task_id) {
            inner.active = None;
        }
        if awaiting_ack {
            inner.pending_completions.insert(task_id);
        }
    }

    /// Signals the executor to stop. Returns false when the task is not the
    /// active one.
    pub fn request_stop(&self, task_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &inner.active {
            Some(active) if active.task_id == task_id => {
                let _ = active.stop_signal.send(true);
                true
            }
            _ => false,
        }
    }

    pub fn stop_any(&self) {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = &inner.active {
            let _ = active.stop_signal.send(true);
        }
    }

    pub fn acknowledge_completion(&self, task_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.pending_completions.remove(&task_id)
    }

    pub fn pending_completions(&self) -> Vec<Uuid> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut pending: Vec<Uuid> = inner.pending_completions.iter().copied().collect();
        pending.sort();
        pending
    }

    pub fn snapshot(&self) -> (Option<(Uuid, Uuid)>, TaskPhase) {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &inner.active {
            Some(active) => (Some((active.task_id, active.job_id)), active.phase),
            None => (None, TaskPhase::Idle),
        }
    }

    /// True when the given task is the one currently being worked on; the
    /// outfile delete handshake refuses deletion in that case.
    pub fn is_working_on(&self, task_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.active.as_ref().map(|active| active.task_id) == Some(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_holds_one_task_and_tracks_acks() {
        let board = TaskBoard::new();
        let task = Uuid::new_v4();
        let job = Uuid::new_v4();

        let mut stop = board.start_task(task, job).unwrap();
        assert!(!*stop.borrow());
        assert!(board.is_working_on(task));
        assert_eq!(board.start_task(Uuid::new_v4(), job).unwrap_err(), task);

        board.mark_completing(task);
        let (_, phase) = board.snapshot();
        assert_eq!(phase, TaskPhase::Completing);

        assert!(board.request_stop(task));
        assert!(stop.has_changed().unwrap());

        board.finish_task(task, true);
        assert!(!board.is_working_on(task));
        assert_eq!(board.pending_completions(), vec![task]);

        assert!(board.acknowledge_completion(task));
        assert!(!board.acknowledge_completion(task));
        assert!(board.pending_completions().is_empty());
    }
}

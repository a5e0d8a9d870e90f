//! Pending and executing cells for one orchestrator.
//!
//! A cell appears in the queue at most once: enqueueing a cell that is
//! already pending or executing is a no-op.

use std::collections::VecDeque;

use serde::Serialize;

/// Status of a queued cell
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CellQueueStatus {
    /// Waiting in queue
    Pending,
    /// Currently executing
    Executing,
}

/// A cell in the execution queue
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueuedCell {
    pub cell_id: String,
    pub status: CellQueueStatus,
    /// Position in queue (0 = currently executing or next)
    pub position: usize,
}

/// Snapshot of the queue published to the store
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExecutionQueueState {
    /// Is the queue processing (has pending or executing cells)?
    pub processing: bool,
    /// Cells currently in queue (pending + executing)
    pub cells: Vec<QueuedCell>,
    /// ID of currently executing cell (if any)
    pub executing_cell_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ExecutionQueue {
    /// Pending cell IDs (FIFO)
    pending: VecDeque<String>,
    /// Currently executing cell ID
    executing: Option<String>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a cell. Returns `false` if it was coalesced with an entry
    /// already pending or executing.
    pub fn enqueue(&mut self, cell_id: &str) -> bool {
        if self.contains(cell_id) {
            return false;
        }
        self.pending.push_back(cell_id.to_string());
        true
    }

    /// Get next cell to execute (if queue is non-empty and nothing executing)
    pub fn dequeue(&mut self) -> Option<String> {
        if self.executing.is_some() {
            return None;
        }
        let cell_id = self.pending.pop_front()?;
        self.executing = Some(cell_id.clone());
        Some(cell_id)
    }

    /// Mark current execution as complete
    pub fn complete(&mut self, cell_id: &str) {
        if self.is_executing(cell_id) {
            self.executing = None;
        }
    }

    /// Clear all pending (but not currently executing)
    pub fn clear_pending(&mut self) -> Vec<String> {
        self.pending.drain(..).collect()
    }

    /// Drop the executing cell and everything pending, executing cell first.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let mut cancelled: Vec<String> = self.executing.take().into_iter().collect();
        cancelled.extend(self.pending.drain(..));
        cancelled
    }

    pub fn executing(&self) -> Option<&str> {
        self.executing.as_deref()
    }

    pub fn is_executing(&self, cell_id: &str) -> bool {
        self.executing.as_deref() == Some(cell_id)
    }

    pub fn contains(&self, cell_id: &str) -> bool {
        self.is_executing(cell_id) || self.pending.iter().any(|id| id == cell_id)
    }

    /// Check if queue is empty (no pending and no executing)
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.executing.is_none()
    }

    pub fn state(&self) -> ExecutionQueueState {
        let cells = self
            .executing
            .iter()
            .map(|id| (id, CellQueueStatus::Executing))
            .chain(self.pending.iter().map(|id| (id, CellQueueStatus::Pending)))
            .enumerate()
            .map(|(position, (cell_id, status))| QueuedCell {
                cell_id: cell_id.clone(),
                status,
                position,
            })
            .collect();

        ExecutionQueueState {
            processing: !self.is_empty(),
            cells,
            executing_cell_id: self.executing.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_creates_empty_queue() {
        let queue = ExecutionQueue::new();
        assert!(queue.is_empty());
        assert!(queue.executing().is_none());
    }

    #[test]
    fn test_enqueue_maintains_fifo_order() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue("cell-1");
        queue.enqueue("cell-2");
        queue.enqueue("cell-3");

        assert_eq!(queue.dequeue(), Some("cell-1".to_string()));
        queue.complete("cell-1");
        assert_eq!(queue.dequeue(), Some("cell-2".to_string()));
    }

    #[test]
    fn test_enqueue_coalesces_pending_cell() {
        let mut queue = ExecutionQueue::new();
        assert!(queue.enqueue("cell-1"));
        assert!(!queue.enqueue("cell-1"));
        assert_eq!(queue.state().cells.len(), 1);
    }

    #[test]
    fn test_enqueue_coalesces_executing_cell() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue("cell-1");
        queue.dequeue();
        assert!(!queue.enqueue("cell-1"));

        queue.complete("cell-1");
        assert!(queue.enqueue("cell-1"));
    }

    #[test]
    fn test_dequeue_returns_none_when_already_executing() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue("cell-1");
        queue.enqueue("cell-2");

        queue.dequeue();
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_executing("cell-1"));
    }

    #[test]
    fn test_complete_only_clears_matching_cell() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue("cell-1");
        queue.dequeue();

        queue.complete("cell-2");
        assert!(queue.is_executing("cell-1"));
    }

    #[test]
    fn test_clear_pending_does_not_clear_executing() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue("cell-1");
        queue.enqueue("cell-2");
        queue.dequeue();

        assert_eq!(queue.clear_pending(), vec!["cell-2"]);
        assert!(queue.is_executing("cell-1"));
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_cancel_all_includes_executing_first() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue("cell-1");
        queue.enqueue("cell-2");
        queue.dequeue();

        assert_eq!(queue.cancel_all(), vec!["cell-1", "cell-2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_state_positions() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue("cell-1");
        queue.enqueue("cell-2");
        queue.dequeue();

        let state = queue.state();
        assert!(state.processing);
        assert_eq!(state.executing_cell_id.as_deref(), Some("cell-1"));
        assert_eq!(
            state.cells,
            vec![
                QueuedCell {
                    cell_id: "cell-1".into(),
                    status: CellQueueStatus::Executing,
                    position: 0,
                },
                QueuedCell {
                    cell_id: "cell-2".into(),
                    status: CellQueueStatus::Pending,
                    position: 1,
                },
            ]
        );
    }

    #[test]
    fn test_state_empty_queue() {
        let state = ExecutionQueue::new().state();
        assert_eq!(state, ExecutionQueueState::default());
    }
}

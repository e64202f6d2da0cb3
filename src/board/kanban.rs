//! Kanban board model.
//!
//! Tasks sit in four fixed status buckets. A drag captures the task and
//! its source bucket; a drop moves the task in memory first (remove from
//! the source, dedupe in the target, prepend) and only then hands a
//! [`StatusChange`] to the server. The server call is fire-and-forget:
//! a failure is logged and the local board is left as it is.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::models::{Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanColumn {
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanBoard {
    pub columns: Vec<KanbanColumn>,
}

/// Captured at drag start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DragState {
    pub task_id: i64,
    pub source: TaskStatus,
}

/// A status move to persist on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub task_id: i64,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl Default for KanbanBoard {
    fn default() -> Self {
        Self {
            columns: TaskStatus::ALL
                .iter()
                .map(|status| KanbanColumn {
                    status: *status,
                    tasks: Vec::new(),
                })
                .collect(),
        }
    }
}

impl KanbanBoard {
    /// Group tasks into the four buckets, most recently updated first.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut board = Self::default();
        for task in tasks {
            board.columns[task.status.index()].tasks.push(task);
        }
        for column in &mut board.columns {
            column
                .tasks
                .sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        }
        board
    }

    pub fn column(&self, status: TaskStatus) -> &[Task] {
        &self.columns[status.index()].tasks
    }

    pub fn find(&self, task_id: i64) -> Option<&Task> {
        self.columns
            .iter()
            .flat_map(|c| c.tasks.iter())
            .find(|t| t.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.columns.iter().map(|c| c.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn begin_drag(&self, task_id: i64) -> Option<DragState> {
        self.columns.iter().find_map(|column| {
            column
                .tasks
                .iter()
                .any(|t| t.id == task_id)
                .then_some(DragState {
                    task_id,
                    source: column.status,
                })
        })
    }

    /// Finish a drag over `target`. Dropping back on the source bucket
    /// changes nothing and returns `None`.
    pub fn drop_on(&mut self, drag: DragState, target: TaskStatus) -> Option<StatusChange> {
        if drag.source == target {
            return None;
        }
        self.move_task(drag.task_id, target)?;
        Some(StatusChange {
            task_id: drag.task_id,
            from: drag.source,
            to: target,
        })
    }

    /// Remove the task from every bucket and prepend it to `target`.
    /// Returns the moved task, or `None` if it is not on the board.
    pub fn move_task(&mut self, task_id: i64, target: TaskStatus) -> Option<&Task> {
        let mut moved: Option<Task> = None;
        for column in &mut self.columns {
            while let Some(pos) = column.tasks.iter().position(|t| t.id == task_id) {
                let task = column.tasks.remove(pos);
                moved.get_or_insert(task);
            }
        }
        let mut task = moved?;
        task.status = target;
        let bucket = &mut self.columns[target.index()].tasks;
        bucket.insert(0, task);
        bucket.first()
    }
}

/// Transport for persisting a [`StatusChange`].
pub trait StatusSync: Send + Sync + 'static {
    fn send_status(
        &self,
        change: StatusChange,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Fire the server call in the background. Failures are only logged; the
/// optimistic board state is not rolled back.
pub fn dispatch_status_change<S: StatusSync>(
    sync: Arc<S>,
    change: StatusChange,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sync.send_status(change).await {
            tracing::warn!(
                task_id = change.task_id,
                from = %change.from,
                to = %change.to,
                error = %e,
                "Failed to persist task status change"
            );
        }
    })
}

//! Typed error hierarchy for crewboard.
//!
//! `BoardError` covers domain failures raised by the storage and access
//! layers. Storage code returns `anyhow::Result`, so these travel inside an
//! `anyhow::Error` and are recovered at the HTTP boundary with
//! `downcast_ref::<BoardError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Comment {id} not found")]
    CommentNotFound { id: i64 },

    #[error("User {id} not found")]
    UserNotFound { id: i64 },

    #[error("Patch note {id} not found")]
    PatchNoteNotFound { id: i64 },

    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid status '{status}'")]
    InvalidStatus { status: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl BoardError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotFound { .. }
                | Self::TaskNotFound { .. }
                | Self::CommentNotFound { .. }
                | Self::UserNotFound { .. }
                | Self::PatchNoteNotFound { .. }
        )
    }
}

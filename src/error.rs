use thiserror::Error;

/// Errors raised by the tracker core.
///
/// Everything except `StructuralMigration` and `Store` is something the
/// caller can correct and retry.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Structural migration failed: {0}")]
    StructuralMigration(String),

    #[error("Database error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl TrackerError {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::Validation(_) => "validation",
            TrackerError::NotFound(_) => "not_found",
            TrackerError::InvalidState(_) => "conflict",
            TrackerError::InvalidStatus(_) => "bad_request",
            TrackerError::StructuralMigration(_) => "migration",
            TrackerError::Store(_) => "store",
        }
    }

    /// Only a failed migration should stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackerError::StructuralMigration(_))
    }

    pub fn is_caller_correctable(&self) -> bool {
        matches!(
            self,
            TrackerError::Validation(_)
                | TrackerError::NotFound(_)
                | TrackerError::InvalidState(_)
                | TrackerError::InvalidStatus(_)
        )
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Whether retrying the same operation later could succeed.
    ///
    /// Only storage failures are; everything else indicates a caller or
    /// configuration bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(_))
    }
}

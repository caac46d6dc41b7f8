//! Error taxonomy shared by the store, the backends and the query pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Stored or returned data violates an invariant (vector length, blob shape).
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// The store cannot be brought to the structure this build expects.
    #[error("incompatible schema: {0}")]
    SchemaIncompatible(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn stage(stage: &'static str, source: Error) -> Self {
        // Cancellation is not a failure of any particular stage.
        if source.is_cancelled() {
            return Error::Cancelled;
        }
        Error::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// Network or database failures that may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Sqlite(_) | Error::Io(_) | Error::Backend(_) | Error::Task(_) => true,
            Error::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wraps_and_names_failure() {
        let err = Error::stage("first batch", Error::Backend("connection refused".into()));
        assert_eq!(err.to_string(), "first batch: backend error: connection refused");
        assert!(err.is_transient());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_stage_passes_cancellation_through() {
        let err = Error::stage("query embedding", Error::Cancelled);
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_integrity_is_not_transient() {
        assert!(!Error::Integrity("bad blob".into()).is_transient());
        assert!(!Error::NotFound { kind: "embedding", id: 3 }.is_transient());
    }
}

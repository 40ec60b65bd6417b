use thiserror::Error;

/// Error taxonomy for the memory engine.
///
/// Every fallible operation maps its failure into one of these categories:
/// validation errors surface to the caller unchanged, provider and store
/// errors are wrapped with their cause preserved in the message.
#[derive(Error, Debug)]
pub enum ZmemError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZmemError {
    /// Stable machine-readable code for the tool-server boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ZmemError::Validation(_) => "VALIDATION",
            ZmemError::NotFound(_) => "NOT_FOUND",
            ZmemError::Conflict(_) => "CONFLICT",
            ZmemError::Embedding(_) => "EMBEDDING",
            ZmemError::Database(_) => "DATABASE",
            ZmemError::Io(_) => "DATABASE",
        }
    }
}

impl From<rusqlite::Error> for ZmemError {
    fn from(e: rusqlite::Error) -> Self {
        ZmemError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ZmemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ZmemError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(ZmemError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(ZmemError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(ZmemError::Embedding("x".into()).code(), "EMBEDDING");
        assert_eq!(ZmemError::Database("x".into()).code(), "DATABASE");
    }

    #[test]
    fn test_sqlite_error_wraps_as_database() {
        let err: ZmemError = rusqlite::Error::InvalidQuery.into();
        assert_eq!(err.code(), "DATABASE");
    }
}

// mongoquery-core/src/error.rs
use thiserror::Error;

/// Failures raised by the driver boundary. They are handed to the caller as-is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Bulk write failed: {0}")]
    BulkWrite(String),

    #[error("Driver runtime error: {0}")]
    Runtime(String),
}

#[derive(Error, Debug)]
pub enum MongoQueryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MongoQueryError {
    /// True when the error came from the driver boundary untouched.
    pub fn is_driver(&self) -> bool {
        matches!(self, MongoQueryError::Driver(_))
    }
}

pub type Result<T> = std::result::Result<T, MongoQueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_passes_through_display() {
        let err: MongoQueryError = DriverError::Authentication("bad credentials".into()).into();
        assert!(err.is_driver());
        assert_eq!(err.to_string(), "Authentication failed: bad credentials");
    }

    #[test]
    fn test_precondition_message_is_verbatim() {
        let err = MongoQueryError::Precondition("no data to update".into());
        assert_eq!(err.to_string(), "no data to update");
        assert!(!err.is_driver());
    }
}

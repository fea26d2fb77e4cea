use std::fmt;

/// Result type for trendpulse-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the store layer
#[derive(Debug)]
pub enum Error {
    /// Database operation failed
    Database(rusqlite::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// A stored value could not be decoded into its domain type
    Decode(String),

    /// Query-specific error (invalid input, not found, etc.)
    Query(String),

    /// A status transition would violate the monotonic item state machine
    InvalidTransition {
        item_id: i64,
        from: String,
        to: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Database(err) => write!(f, "Database error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::InvalidTransition { item_id, from, to } => write!(
                f,
                "Invalid status transition for item {}: {} -> {}",
                item_id, from, to
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<trendpulse_types::Error> for Error {
    fn from(err: trendpulse_types::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

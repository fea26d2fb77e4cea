use std::fmt;

/// Result type for trendpulse-llm operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur when talking to the model endpoints
#[derive(Debug)]
pub enum Error {
    /// Transport-level failure (connect, timeout, TLS, ...)
    Http(reqwest::Error),

    /// The endpoint answered with a non-success status
    Api { status: u16, body: String },

    /// The endpoint answered 2xx but the payload was not the expected shape
    MalformedResponse(String),

    /// The SSE stream broke or produced an unreadable frame
    Stream(String),
}

impl Error {
    /// Whether a retry has a chance of succeeding: timeouts, connection
    /// failures, 429 and 5xx. Malformed payloads and 4xx are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            Error::MalformedResponse(_) => false,
            Error::Stream(_) => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(err) => write!(f, "HTTP error: {}", err),
            Error::Api { status, body } => write!(f, "API error {}: {}", status, body),
            Error::MalformedResponse(msg) => write!(f, "Malformed response: {}", msg),
            Error::Stream(msg) => write!(f, "Stream error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err)
    }
}

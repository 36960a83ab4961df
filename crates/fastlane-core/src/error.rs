use std::fmt;

/// Main error type for fastlane
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Document store errors (SQLx wrapped)
    Database(sqlx::Error),

    /// Queue errors (Redis wrapped or semantic)
    Queue(String),

    /// Container runtime errors
    Runtime(crate::runtime::RuntimeError),

    /// Validation errors (rejected at creation, never stored)
    Validation(String),

    /// Not found errors
    NotFound(String),

    /// Conflict with the current lifecycle state (e.g. stop on a terminal job)
    Conflict(String),

    /// Notification side-channel errors
    Notification(String),

    /// HTTP/Network errors
    Network(String),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Queue(msg) => write!(f, "Queue error: {}", msg),
            Error::Runtime(e) => write!(f, "Runtime error: {}", e),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::Notification(msg) => write!(f, "Notification error: {}", msg),
            Error::Network(msg) => write!(f, "Network error: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Runtime(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<redis::RedisError> for Error {
    fn from(error: redis::RedisError) -> Self {
        Error::Queue(error.to_string())
    }
}

impl From<crate::runtime::RuntimeError> for Error {
    fn from(error: crate::runtime::RuntimeError) -> Self {
        Error::Runtime(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Network(error.to_string())
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a new queue error
    pub fn queue<T: Into<String>>(msg: T) -> Self {
        Error::Queue(msg.into())
    }

    /// Create a new notification error
    pub fn notification<T: Into<String>>(msg: T) -> Self {
        Error::Notification(msg.into())
    }

    /// Create a new network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        Error::Network(msg.into())
    }
}

impl Error {
    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Queue(_) => 500,
            Error::Runtime(_) => 500,
            Error::Notification(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Network(_) => 503,
            Error::Other(_) => 500,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Queue(_) => "queue",
            Error::Runtime(_) => "runtime",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Notification(_) => "notification",
            Error::Network(_) => "network",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }

    /// Whether the failure is transient infrastructure trouble that a
    /// redelivery may clear (store/queue/runtime unreachable), as opposed to
    /// a permanent fault that must mutate job state.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(_) | Error::Queue(_) | Error::Network(_) => true,
            Error::Runtime(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("bad cron").status_code(), 400);
        assert_eq!(Error::not_found("job").status_code(), 404);
        assert_eq!(Error::conflict("already terminal").status_code(), 409);
        assert_eq!(Error::queue("down").status_code(), 500);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::queue("connection reset").is_transient());
        assert!(Error::network("timeout").is_transient());
        assert!(!Error::validation("bad envs").is_transient());
        assert!(!Error::conflict("terminal").is_transient());
    }

    #[test]
    fn test_categories() {
        assert_eq!(Error::validation("x").category(), "validation");
        assert_eq!(Error::conflict("x").category(), "conflict");
    }
}

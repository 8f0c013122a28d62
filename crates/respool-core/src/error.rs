//! Error types for respool

use crate::domain::locking::LockError;
use thiserror::Error;

/// Result type alias using respool's Error
pub type Result<T> = std::result::Result<T, Error>;

/// respool error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Lock errors (E300-E399)
    #[error(transparent)]
    Lock(#[from] LockError),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Generic errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Lock(err) => err.code(),
            Self::ConfigError(_) => "E600",
            Self::ConfigParse(_) => "E601",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Lock(LockError::Timeout { .. }) => {
                Some("Retry, or raise the lock timeout".to_string())
            }
            Self::Lock(LockError::ReentrantUse { .. }) => {
                Some("Unlock the user before locking it again".to_string())
            }
            Self::Lock(LockError::NoResources { .. }) => {
                Some("Give the user at least one resource".to_string())
            }
            Self::Lock(LockError::NoContext) => {
                Some("Run the task inside respool_core::context::scope".to_string())
            }
            Self::ConfigError(_) | Self::ConfigParse(_) => {
                Some("respool config".to_string())
            }
            _ => None,
        }
    }

    /// Whether retrying the failed operation can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Lock(err) if err.is_recoverable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_keeps_code() {
        let err: Error = LockError::Timeout {
            user: "P1".to_string(),
            waited_ms: 50,
        }
        .into();

        assert_eq!(err.code(), "E300");
        assert!(err.is_recoverable());
        assert!(err.suggestion().is_some());
        assert!(err.to_string().contains("P1"));
    }

    #[test]
    fn test_programming_errors_not_recoverable() {
        let err = Error::from(LockError::NoContext);
        assert!(!err.is_recoverable());
        assert!(err.suggestion().unwrap().contains("scope"));
    }

    #[test]
    fn test_config_error_codes() {
        let err = Error::ConfigError("philosophers must be at least 1".to_string());
        assert_eq!(err.code(), "E600");

        let parse = toml::from_str::<toml::Value>("not = = toml").unwrap_err();
        assert_eq!(Error::from(parse).code(), "E601");
    }

    #[test]
    fn test_io_error() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.code(), "E9999");
        assert!(err.suggestion().is_none());
    }
}

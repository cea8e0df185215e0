/*!
 * Error types for Tollgate
 */

use std::io;
use thiserror::Error;
use tollgate_core_resilience::ResilienceError;

pub type Result<T> = std::result::Result<T, TollgateError>;

/// Errors raised while loading configuration or setting up the client layer.
///
/// Failures of controlled runs are reported separately, as
/// [`tollgate_core_resilience::ExecutionError`].
#[derive(Debug, Error)]
pub enum TollgateError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be written
    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A component rejected its configuration
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// Logging could not be initialised
    #[error("Logging error: {0}")]
    Logging(String),
}

impl TollgateError {
    /// Check if this error came from configuration (file or values)
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TollgateError::ConfigParse(_)
                | TollgateError::ConfigSerialize(_)
                | TollgateError::Config(_)
                | TollgateError::Resilience(ResilienceError::InvalidConfig(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TollgateError::Config("cooldown must be finite".to_string());
        assert_eq!(err.to_string(), "Configuration error: cooldown must be finite");

        let err: TollgateError = ResilienceError::InvalidConfig("capacity must be > 0".into()).into();
        assert_eq!(err.to_string(), "Invalid configuration: capacity must be > 0");
    }

    #[test]
    fn test_is_config_error() {
        assert!(TollgateError::Config("x".into()).is_config_error());
        assert!(TollgateError::from(ResilienceError::InvalidConfig("x".into())).is_config_error());

        let io_err = TollgateError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(!io_err.is_config_error());
        assert!(!TollgateError::Logging("x".into()).is_config_error());
    }
}

//! Error types for previewdb services

/// Result type alias using PreviewError
pub type Result<T> = std::result::Result<T, PreviewError>;

/// Main error type for previewdb services
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PreviewError {
    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            PreviewError::ConfigError(_) => "CONFIG_ERROR",
        }
    }
}

impl From<config::ConfigError> for PreviewError {
    fn from(err: config::ConfigError) -> Self {
        PreviewError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_conversion() {
        let err: PreviewError = config::ConfigError::NotFound("server.port".into()).into();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().starts_with("Configuration error:"));
    }
}

use thiserror::Error;

/// Application-wide error types.
///
/// Request-path denials (rate limit, auth) are not errors in this sense: they
/// are expected outcomes and are turned into responses directly by their
/// middleware. `AppError` covers startup and dispatcher failures.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Tool '{tool}' failed: {message}")]
    ToolError { tool: String, message: String },
}

impl AppError {
    /// Build a tool failure for the named tool.
    pub fn tool(tool: &str, message: impl Into<String>) -> Self {
        AppError::ToolError {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = AppError::ConfigError("Invalid PORT: bad".to_string());
        assert_eq!(err.to_string(), "Configuration error: Invalid PORT: bad");
    }

    #[test]
    fn test_tool_error_display() {
        let err = AppError::tool("generate_uuid", "boom");
        assert_eq!(err.to_string(), "Tool 'generate_uuid' failed: boom");
    }

    #[test]
    fn test_serde_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: AppError = parse.into();
        assert!(matches!(err, AppError::SerializationError(_)));
    }
}

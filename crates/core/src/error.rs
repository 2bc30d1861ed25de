//! Error types for the Loopwire domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.

use thiserror::Error;

/// The `error.type` value the upstream provider uses for capacity overload.
pub const OVERLOADED_ERROR_TYPE: &str = "overloaded_error";

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    /// An `error` event delivered inside an otherwise healthy stream.
    #[error("Upstream stream error ({error_type}): {message}")]
    StreamError { error_type: String, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether this failure is transient capacity overload.
    ///
    /// Matches either the structured error type or, for errors that only
    /// carry free text, the word "overloaded" anywhere in the message.
    pub fn is_overloaded(&self) -> bool {
        match self {
            Self::Overloaded(_) => true,
            Self::StreamError { error_type, .. } if error_type == OVERLOADED_ERROR_TYPE => true,
            other => other.to_string().to_lowercase().contains("overloaded"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

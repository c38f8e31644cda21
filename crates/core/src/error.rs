//! Error taxonomy shared by the dispatcher, handlers and transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Closed set of error kinds. Codes are part of the wire contract and are
/// never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ToolNotFound,
    ToolExecutionError,
    ResourceNotFound,
    /// Reserved for transport-layer collaborators
    RateLimitExceeded,
    /// Reserved for transport-layer collaborators
    AuthorizationError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::ParseError,
        ErrorKind::InvalidRequest,
        ErrorKind::MethodNotFound,
        ErrorKind::InvalidParams,
        ErrorKind::InternalError,
        ErrorKind::ToolNotFound,
        ErrorKind::ToolExecutionError,
        ErrorKind::ResourceNotFound,
        ErrorKind::RateLimitExceeded,
        ErrorKind::AuthorizationError,
    ];

    /// Numeric JSON-RPC error code
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::ParseError => -32700,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::InternalError => -32603,
            ErrorKind::ToolNotFound => -32001,
            ErrorKind::ToolExecutionError => -32002,
            ErrorKind::ResourceNotFound => -32003,
            ErrorKind::RateLimitExceeded => -32004,
            ErrorKind::AuthorizationError => -32005,
        }
    }

    /// Reverse lookup of a wire code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Every error that crosses the dispatcher boundary.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams {
        message: String,
        data: Option<Value>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("Tool '{name}' failed: {source}")]
    ToolExecution {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_ms: Option<u64> },

    #[error("Authorization failed: {0}")]
    Authorization(String),
}

impl DispatchError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::ParseError,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            Self::InvalidParams { .. } => ErrorKind::InvalidParams,
            Self::Internal(_) => ErrorKind::InternalError,
            Self::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Self::ToolExecution { .. } => ErrorKind::ToolExecutionError,
            Self::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::Authorization(_) => ErrorKind::AuthorizationError,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    /// Structured payload for the `data` member of the wire error
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::MethodNotFound { method } => Some(serde_json::json!({ "method": method })),
            Self::InvalidParams { data, .. } => data.clone(),
            Self::ToolNotFound { name } => Some(serde_json::json!({ "tool": name })),
            Self::ToolExecution { name, source } => Some(serde_json::json!({
                "tool": name,
                "cause": format!("{:#}", source),
            })),
            Self::ResourceNotFound { uri } => Some(serde_json::json!({ "uri": uri })),
            Self::RateLimitExceeded {
                retry_after_ms: Some(ms),
            } => Some(serde_json::json!({ "retryAfterMs": ms })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorKind::ParseError.code(), -32700);
        assert_eq!(ErrorKind::InvalidRequest.code(), -32600);
        assert_eq!(ErrorKind::MethodNotFound.code(), -32601);
        assert_eq!(ErrorKind::InvalidParams.code(), -32602);
        assert_eq!(ErrorKind::InternalError.code(), -32603);
        assert_eq!(ErrorKind::ToolNotFound.code(), -32001);
        assert_eq!(ErrorKind::ToolExecutionError.code(), -32002);
        assert_eq!(ErrorKind::ResourceNotFound.code(), -32003);
        assert_eq!(ErrorKind::RateLimitExceeded.code(), -32004);
        assert_eq!(ErrorKind::AuthorizationError.code(), -32005);
    }

    #[test]
    fn test_codes_are_unique() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
    }

    #[test]
    fn test_tool_execution_keeps_cause() {
        let err = DispatchError::ToolExecution {
            name: "web_fetch".to_string(),
            source: anyhow::anyhow!("connection refused"),
        };

        assert_eq!(err.kind(), ErrorKind::ToolExecutionError);
        assert!(err.to_string().contains("connection refused"));
        let data = err.data().unwrap();
        assert_eq!(data["tool"], "web_fetch");
        assert_eq!(data["cause"], "connection refused");
    }

    #[test]
    fn test_method_not_found_message() {
        let err = DispatchError::method_not_found("unknown/x");
        assert_eq!(err.code(), -32601);
        assert!(err.to_string().contains("unknown/x"));
    }
}

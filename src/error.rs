//! Error types for the goblin gateway

use std::io;

use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
///
/// Each variant maps to exactly one wire code (see [`Error::to_rpc_code`]).
/// Peer-raised execution errors preserve the peer's code, message, and data
/// verbatim; everything else is gateway-owned and uses the JSON-RPC
/// server-error range.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup only; the process exits non-zero)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request arguments failed schema validation
    #[error("Invalid arguments: {0}")]
    Validation(String),

    /// Malformed or out-of-sequence frontend request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown frontend method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// No backend with the given name
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// No tool with the given namespaced id
    #[error("Tool not found: {name}")]
    ToolNotFound {
        /// The namespaced id that failed to resolve
        name: String,
        /// Near-miss candidates from the catalog
        suggestions: Vec<String>,
    },

    /// No prompt with the given namespaced id
    #[error("Prompt not found: {name}")]
    PromptNotFound {
        /// The namespaced id that failed to resolve
        name: String,
        /// Near-miss candidates from the catalog
        suggestions: Vec<String>,
    },

    /// No resource with the given namespaced URI
    #[error("Resource not found: {uri}")]
    ResourceNotFound {
        /// The namespaced URI that failed to resolve
        uri: String,
        /// Near-miss candidates from the catalog
        suggestions: Vec<String>,
    },

    /// Transport-level failure (connect, read, write, peer EOF)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Circuit breaker rejected the call
    #[error("Circuit open for backend '{backend}'")]
    CircuitOpen {
        /// Backend whose circuit is open
        backend: String,
    },

    /// The peer did not respond within the deadline
    #[error("Request to '{backend}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Backend that timed out
        backend: String,
        /// The applied deadline in milliseconds
        timeout_ms: u64,
    },

    /// Peer-raised error, preserved verbatim
    #[error("Peer error {code}: {message}")]
    Peer {
        /// Peer-supplied error code
        code: i32,
        /// Peer-supplied message
        message: String,
        /// Peer-supplied data
        data: Option<Value>,
    },

    /// Per-client subscription limit reached
    #[error("Subscription limit exceeded ({limit}) for client {client_id}")]
    SubscriptionLimitExceeded {
        /// Client that hit the limit
        client_id: String,
        /// The configured limit
        limit: usize,
    },

    /// The backend does not support the requested operation
    #[error("Method not supported by backend '{backend}': {method}")]
    MethodNotSupported {
        /// Backend lacking the capability
        backend: String,
        /// The unsupported method
        method: String,
    },

    /// The request was cancelled (client disconnect or shutdown)
    #[error("Request cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to the JSON-RPC wire code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Peer { code, .. } => *code,
            Self::InvalidRequest(_) => rpc_codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::Validation(_) => rpc_codes::INVALID_PARAMS,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::ServerNotFound(_) => rpc_codes::SERVER_NOT_FOUND,
            Self::ToolNotFound { .. } => rpc_codes::TOOL_NOT_FOUND,
            Self::PromptNotFound { .. } => rpc_codes::PROMPT_NOT_FOUND,
            Self::ResourceNotFound { .. } => rpc_codes::RESOURCE_NOT_FOUND,
            Self::Connection(_) | Self::Http(_) | Self::Io(_) => rpc_codes::CONNECTION_ERROR,
            Self::CircuitOpen { .. } => rpc_codes::CIRCUIT_OPEN,
            Self::RequestTimeout { .. } => rpc_codes::REQUEST_TIMEOUT,
            Self::SubscriptionLimitExceeded { .. } => rpc_codes::SUBSCRIPTION_LIMIT,
            Self::MethodNotSupported { .. } => rpc_codes::METHOD_NOT_SUPPORTED,
            Self::Cancelled => rpc_codes::CANCELLED,
            Self::Config(_) | Self::Internal(_) => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Minimal diagnostic context for the wire `data` field.
    ///
    /// Never includes stack traces or raw peer payloads; peer errors carry
    /// their own data through untouched.
    #[must_use]
    pub fn to_rpc_data(&self) -> Option<Value> {
        match self {
            Self::Peer { data, .. } => data.clone(),
            Self::ToolNotFound { suggestions, .. }
            | Self::PromptNotFound { suggestions, .. }
            | Self::ResourceNotFound { suggestions, .. } => {
                Some(json!({ "suggestions": suggestions }))
            }
            Self::CircuitOpen { backend } => Some(json!({ "backendName": backend })),
            Self::RequestTimeout {
                backend,
                timeout_ms,
            } => Some(json!({ "backendName": backend, "timeoutMs": timeout_ms })),
            Self::SubscriptionLimitExceeded { limit, .. } => Some(json!({ "limit": limit })),
            Self::MethodNotSupported { backend, method } => {
                Some(json!({ "backendName": backend, "method": method }))
            }
            _ => None,
        }
    }

    /// Whether this failure counts against the circuit breaker.
    ///
    /// Peer errors are semantic results, cancellations are caller-initiated;
    /// only infrastructural failures count.
    #[must_use]
    pub fn is_infrastructural(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Http(_)
                | Self::Io(_)
                | Self::RequestTimeout { .. }
                | Self::Internal(_)
        )
    }
}

/// Standard and gateway-assigned JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - not a valid Request object, or sent before initialize
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// No backend with the requested name
    pub const SERVER_NOT_FOUND: i32 = -32001;
    /// No tool with the requested namespaced id
    pub const TOOL_NOT_FOUND: i32 = -32002;
    /// No prompt with the requested namespaced id
    pub const PROMPT_NOT_FOUND: i32 = -32003;
    /// No resource with the requested namespaced URI
    pub const RESOURCE_NOT_FOUND: i32 = -32004;
    /// Transport-level failure reaching the backend
    pub const CONNECTION_ERROR: i32 = -32010;
    /// Circuit breaker open for the backend
    pub const CIRCUIT_OPEN: i32 = -32011;
    /// Deadline elapsed waiting for the backend
    pub const REQUEST_TIMEOUT: i32 = -32012;
    /// Per-client subscription limit reached
    pub const SUBSCRIPTION_LIMIT: i32 = -32013;
    /// Backend does not advertise the required capability
    pub const METHOD_NOT_SUPPORTED: i32 = -32014;
    /// Request cancelled by the client or shutdown
    pub const CANCELLED: i32 = -32015;
}

//! Error types for the signing flow.

use thiserror::Error;

use crate::provider::ProviderRpcError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Reconnection error: {message}")]
    Reconnection { message: String },

    #[error("Signing client is not connected")]
    NotConnected,

    #[error(transparent)]
    Rpc(#[from] ProviderRpcError),

    #[error("Unexpected response to {method}: {message}")]
    UnexpectedResponse { method: String, message: String },

    #[error("Malformed typed data: {message}")]
    TypedData { message: String },

    #[error("Payload authentication error: {message}")]
    PayloadAuth { message: String },
}

impl Error {
    /// Whether this error is fatal at startup rather than surfaced at a call site.
    pub fn is_startup_error(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::ConfigFile(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_classification() {
        let err = Error::Config {
            message: "FORDEFI_API_USER_TOKEN is not set".to_string(),
        };
        assert!(err.is_startup_error());
        assert!(!Error::NotConnected.is_startup_error());
    }

    #[test]
    fn test_rpc_error_display_is_verbatim() {
        let rpc = ProviderRpcError::new(4001, "User rejected the request");
        let err: Error = rpc.into();
        assert_eq!(err.to_string(), "Provider RPC error 4001: User rejected the request");
    }
}

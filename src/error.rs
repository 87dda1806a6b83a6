//! Crate-level error type.

use thiserror::Error;

/// Everything that can go wrong between the HTTP edge, the relay and a
/// generation provider.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid or contradictory configuration (CLI, env or TOML file).
    #[error("configuration error: {0}")]
    Config(String),

    /// A provider API key is missing from the environment.
    #[error("{0} not set. Export it or pass via environment.")]
    MissingApiKey(&'static str),

    /// Transport-level failure talking to a provider or to the relay server.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-2xx status.
    #[error("{provider} API error (HTTP {status}): {body}")]
    Provider {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// The relay server refused a question.
    #[error("server replied HTTP {status}: {body}")]
    Server { status: u16, body: String },

    /// A streamed payload could not be understood.
    #[error("malformed stream payload: {0}")]
    Decode(String),

    /// The caller sent something the endpoint will not accept.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_message_names_variable() {
        let err = RelayError::MissingApiKey("OPENAI_API_KEY");
        assert_eq!(
            err.to_string(),
            "OPENAI_API_KEY not set. Export it or pass via environment."
        );
    }

    #[test]
    fn test_provider_error_display() {
        let err = RelayError::Provider {
            provider: "openai",
            status: 429,
            body: "slow down".to_string(),
        };
        assert_eq!(err.to_string(), "openai API error (HTTP 429): slow down");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Io(_)));
    }
}

use thiserror::Error;

/// CLI-specific errors with contextual messages and suggestions
#[derive(Debug, Error)]
pub enum CliError {
    /// Could not reach a master instance
    #[error("No master reachable on port {port}")]
    MasterUnreachable {
        port: u16,
        suggestion: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigurationError {
        message: String,
        suggestion: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Unexpected response from a fleet endpoint
    #[error("Unexpected response from {endpoint}: {message}")]
    ProtocolError { endpoint: String, message: String },
}

impl CliError {
    /// Suggested next step for the user, when there is one.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::MasterUnreachable { suggestion, .. }
            | Self::ConfigurationError { suggestion, .. } => Some(suggestion),
            Self::ProtocolError { .. } => None,
        }
    }
}

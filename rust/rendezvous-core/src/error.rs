// rust/rendezvous-core/src/error.rs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RendezvousError {

    #[error("Identifier generation failed: {message}")]
    Generation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Transport error at '{endpoint}': {message}")]
    Transport {
        endpoint: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Timed out after {timeout:?} while {stage}")]
    Timeout {
        stage: String,
        timeout: Duration,
    },

    #[error("Barrier in phase {phase}: {message}")]
    State {
        phase: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid identifier: expected {expected} bytes, got {actual}")]
    InvalidIdentifier {
        expected: usize,
        actual: usize,
    },

    #[error("Variable '{name}' not found in scope")]
    VariableNotFound {
        name: String,
    },
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

// Convenience constructors
impl RendezvousError {

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
            source: None,
        }
    }

    pub fn generation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Generation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn timeout(stage: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            stage: stage.into(),
            timeout,
        }
    }

    pub fn state(phase: impl std::fmt::Debug, message: impl Into<String>) -> Self {
        Self::State {
            phase: format!("{:?}", phase),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_identifier(expected: usize, actual: usize) -> Self {
        Self::InvalidIdentifier { expected, actual }
    }

    pub fn variable_not_found(name: impl Into<String>) -> Self {
        Self::VariableNotFound { name: name.into() }
    }

    /// Returns true for errors caused by missing progress rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

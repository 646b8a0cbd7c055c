//! Error types for hostwall-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Main error type for hostwall-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Packet parsing failed
    #[error("packet parsing error: {message}")]
    PacketParse {
        /// Detailed error message
        message: String,
    },

    /// Packet is too small to process
    #[error("packet too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall {
        /// Minimum expected size
        expected: usize,
        /// Actual packet size
        actual: usize,
    },

    /// Configuration file not found or unreadable
    #[error("configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Configuration is invalid
    #[error("{0}")]
    Config(String),

    /// Failed to open or configure a packet queue
    #[error("error starting nfqueue {queue_num}: {source}")]
    QueueSetup {
        /// Queue number that failed to open
        queue_num: u16,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Host resolver failure
    #[error("resolver error for '{name}': {message}")]
    Resolve {
        /// The hostname or address being looked up
        name: String,
        /// Failure reason
        message: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a packet parse error
    pub fn packet_parse(message: impl Into<String>) -> Self {
        Self::PacketParse {
            message: message.into(),
        }
    }

    /// Create a config validation error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a resolver error
    pub fn resolve(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolve {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True for errors that stem from an invalid configuration, as
    /// opposed to runtime failures. The CLI maps these to a distinct
    /// exit code.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ConfigNotFound { .. } | Self::TomlParse(_))
    }
}

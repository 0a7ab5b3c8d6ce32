//! Error type definitions for Syng
//!
//! The top-level [`AppError`] covers every failure the relay or the
//! playback client can hit. Source-level failures have their own enum so
//! they can be isolated to the song or search request they concern.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Transport-level failures (socket dropped, connect refused)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Malformed or unexpected events on the wire
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Wrong secret or missing privilege
    #[error("Authorization failed: {message}")]
    Auth { message: String },

    /// Source handling errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Launching or controlling the player subprocess failed
    #[error("Player error: {message}")]
    Player { message: String },

    /// Configuration errors (file level or option level)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// I/O errors outside a specific source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding failures
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config file failures
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Source handling specific errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Invalid source configuration, rejected at configure time
    #[error("Invalid configuration for {source_name}: {message}")]
    ConfigInvalid {
        source_name: String,
        message: String,
    },

    /// One source's search failed; other sources' results still count
    #[error("Search failed for {source_name}: {message}")]
    SearchFailed {
        source_name: String,
        message: String,
    },

    /// Buffering failed; the entry is marked failed and playback skips it
    #[error("Buffering failed for {id}: {message}")]
    BufferFailed { id: String, message: String },

    /// The source id could not be resolved into an entry
    #[error("Could not resolve {id} via {source_name}: {message}")]
    ResolveFailed {
        source_name: String,
        id: String,
        message: String,
    },

    /// The source name is not known to the registry
    #[error("Unknown source: {0}")]
    Unknown(String),
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a transport error with a custom message
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error for a malformed event
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an authorization error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a player error
    pub fn player<S: Into<String>>(message: S) -> Self {
        Self::Player {
            message: message.into(),
        }
    }
}

impl SourceError {
    /// Create an invalid config error
    pub fn config_invalid<S: Into<String>, M: Into<String>>(source: S, message: M) -> Self {
        Self::ConfigInvalid {
            source_name: source.into(),
            message: message.into(),
        }
    }

    /// Create a search failed error
    pub fn search_failed<S: Into<String>, M: Into<String>>(source: S, message: M) -> Self {
        Self::SearchFailed {
            source_name: source.into(),
            message: message.into(),
        }
    }

    /// Create a buffer failed error
    pub fn buffer_failed<I: Into<String>, M: Into<String>>(id: I, message: M) -> Self {
        Self::BufferFailed {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create a resolve failed error
    pub fn resolve_failed<S: Into<String>, I: Into<String>, M: Into<String>>(
        source: S,
        id: I,
        message: M,
    ) -> Self {
        Self::ResolveFailed {
            source_name: source.into(),
            id: id.into(),
            message: message.into(),
        }
    }
}

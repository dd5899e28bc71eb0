//! Error types for the hot rebuild loop

use thiserror::Error;

use crate::bundler::BundleError;

/// Main error type for jasmine-hmr
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or resolved
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The bundler rejected a build
    #[error("BundleError: {0}")]
    Bundle(#[from] BundleError),

    /// A rebuild pass failed; carries the rendered cause so every waiter gets a copy
    #[error("RebuildError: {0}")]
    Rebuild(String),

    /// Channel to the test host failed
    #[error("TransportError: {0}")]
    Transport(String),

    /// Filesystem watcher could not be started
    #[error("WatchError: {0}")]
    Watch(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watch(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type for jasmine-hmr operations
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for Plugtree

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("load rejected: {unit} - {reason}")]
    LoadRejected { unit: String, reason: String },

    #[error("pre contract {hook} rejected call to {target}: {message}")]
    PreconditionFailed {
        hook: String,
        target: String,
        message: String,
    },

    #[error("signature errors in {unit}:\n{}", .errors.join("\n"))]
    SignatureMismatch { unit: String, errors: Vec<String> },

    #[error("cannot bind arguments for {target}: {message}")]
    BindError { target: String, message: String },

    #[error("unknown symbol '{symbol}' referenced by {unit}")]
    UnknownSymbol { unit: String, symbol: String },

    #[error("invalid plugin unit {path}: {message}")]
    InvalidUnit { path: String, message: String },

    #[error("manifest error: {path} - {message}")]
    Manifest { path: String, message: String },

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn load_rejected(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadRejected {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    pub fn precondition_failed(
        hook: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PreconditionFailed {
            hook: hook.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn bind_error(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BindError {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn invalid_unit(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUnit {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn manifest(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Shorthand for plugin bodies reporting their own failures.
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

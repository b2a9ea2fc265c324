//! Error types shared by every stimrt component.
//!
//! Variants follow the failure classes of the runtime:
//!
//! - **Buffer contract** (`Range`, `ShapeMismatch`, `TypeMismatch`): programmer
//!   errors against an attribute's declared layout. Fail fast, never clamp.
//! - **Dispatch** (`UnknownFunction`, `DuplicateFunction`, `Rpc`): recovered
//!   locally by the process core and logged.
//! - **Channel** (`ChannelClosed`, `ChannelFull`): surfaced to the sender, never
//!   retried.
//! - **Routine** (`Routine`): a failing tick step, caught around `main()`.
//! - **Protocol** (`Protocol`, `RecordingFolderMissing`): aborts the requested
//!   protocol or recording operation.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type StimResult<T> = Result<T, StimError>;

#[derive(Debug, Error)]
pub enum StimError {
    /// Read/write outside the buffer contract (count beyond capacity, bad index)
    #[error("range error: {0}")]
    Range(String),

    /// Record or encoded value does not fit the declared slot layout
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Attribute opened with an element type other than the declared one
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{0}' is already registered")]
    DuplicateFunction(String),

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("channel '{0}' is closed")]
    ChannelClosed(String),

    #[error("channel '{0}' is full")]
    ChannelFull(String),

    #[error("routine '{routine}' failed: {message}")]
    Routine { routine: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("recording folder '{}' does not exist", .0.display())]
    RecordingFolderMissing(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StimError {
    pub fn range(msg: impl Into<String>) -> Self {
        StimError::Range(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        StimError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        StimError::Protocol(msg.into())
    }

    pub fn routine(routine: impl Into<String>, message: impl Into<String>) -> Self {
        StimError::Routine {
            routine: routine.into(),
            message: message.into(),
        }
    }

    /// Errors that must take the whole process down instead of being logged.
    ///
    /// A failed attribute write would desynchronize every consumer of that
    /// buffer, and a closed channel means the peer is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StimError::ShapeMismatch(_) | StimError::TypeMismatch(_) | StimError::ChannelClosed(_)
        )
    }
}

impl From<serde_json::Error> for StimError {
    fn from(err: serde_json::Error) -> Self {
        StimError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StimError {
    fn from(err: serde_yaml::Error) -> Self {
        StimError::Config(format!("YAML: {}", err))
    }
}

impl From<toml::de::Error> for StimError {
    fn from(err: toml::de::Error) -> Self {
        StimError::Config(format!("TOML: {}", err))
    }
}

impl From<bincode::Error> for StimError {
    fn from(err: bincode::Error) -> Self {
        StimError::Serialization(err.to_string())
    }
}

impl From<String> for StimError {
    fn from(msg: String) -> Self {
        StimError::Internal(msg)
    }
}

impl From<&str> for StimError {
    fn from(msg: &str) -> Self {
        StimError::Internal(msg.to_string())
    }
}

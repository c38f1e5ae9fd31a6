use std::fmt;

use thiserror::Error;

pub(crate) const UNKNOWN_ERROR: &str = "(unknown error)";

/// Startup phase in which the handler script failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Loading,
    Initializing,
}

impl fmt::Display for InitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitPhase::Loading => f.write_str("loading"),
            InitPhase::Initializing => f.write_str("initializing"),
        }
    }
}

/// Failures outside of a running request handler.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The handler script could not be read, parsed, or its top level failed.
    #[error("Error {phase} Lua handler: {message}")]
    Load { phase: InitPhase, message: String },

    /// The handler script defines no callable `handle_request`.
    #[error("Error: Lua handler provides no handle_request() callback.")]
    MissingCallback,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    Runtime,
    Memory,
}

/// Error raised by a request handler during its protected call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Runtime, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Memory, message)
    }

    fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            message
        };
        Self { kind, message }
    }
}

impl From<&mlua::Error> for HandlerError {
    fn from(err: &mlua::Error) -> Self {
        match err {
            mlua::Error::MemoryError(message) => HandlerError::memory(message.clone()),
            mlua::Error::CallbackError { cause, .. } => HandlerError::from(cause.as_ref()),
            other => HandlerError::runtime(lua_error_text(other)),
        }
    }
}

/// Message text of a Lua error without mlua's variant prefix.
pub(crate) fn lua_error_text(err: &mlua::Error) -> String {
    let text = match err {
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => lua_error_text(cause),
        other => other.to_string(),
    };
    if text.is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        text
    }
}

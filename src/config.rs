use std::path::PathBuf;

use crate::error::BridgeError;

pub const DEFAULT_LUA_PREFIX: &str = "/lua";

/// Process-wide settings, fixed before the Lua runtime is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Document root exposed to scripts as `uhttpd.docroot`.
    pub docroot: PathBuf,
    /// Handler script loaded once at startup.
    pub lua_handler: PathBuf,
    /// URL prefix routed to the handler.
    pub lua_prefix: String,
}

impl Config {
    pub fn new(docroot: impl Into<PathBuf>, lua_handler: impl Into<PathBuf>) -> Self {
        Self {
            docroot: docroot.into(),
            lua_handler: lua_handler.into(),
            lua_prefix: DEFAULT_LUA_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lua_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.lua_prefix.is_empty() {
            return Err(BridgeError::InvalidConfig("lua prefix must not be empty".into()));
        }
        if !self.lua_prefix.starts_with('/') {
            return Err(BridgeError::InvalidConfig(format!(
                "lua prefix must start with '/': {}",
                self.lua_prefix
            )));
        }
        Ok(())
    }

    pub(crate) fn docroot_display(&self) -> String {
        self.docroot.to_string_lossy().into_owned()
    }
}

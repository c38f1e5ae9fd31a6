//! Lua request-handler bridge for a small HTTP server.
//!
//! One Lua runtime is created at startup from a handler script. Every request under
//! the configured prefix runs in its own forked process, where the script's
//! `handle_request(env)` callback receives a CGI-style environment table and writes the
//! raw response to standard output.

pub mod body;
mod cgi;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod host;
mod request;
pub mod response;
pub mod runtime;
pub mod server;
pub mod urlcodec;

pub use config::Config;
pub use error::{BridgeError, HandlerError};
pub use executor::{lua_plugin_init, LuaDispatch};
pub use host::{DispatchHandler, Dispatcher, Host, HostClient, PathInfo, ProcessVar};
pub use runtime::{LuaRuntime, RequestHandler};
pub use server::{Server, ServerHandle, ServerHost};

//! Contracts between the Lua bridge and the HTTP server hosting it.
//!
//! The server owns connections, request parsing, and process creation. The bridge
//! only sees a client handle plus the operations below.

use std::io::{self, Write};
use std::path::PathBuf;

/// Per-request path metadata handed to the process-isolation primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathInfo {
    /// Logical name: the URL prefix the request matched.
    pub name: String,
    /// Physical path of the script serving the prefix.
    pub phys: PathBuf,
    /// Query part of the URL including the leading `?`.
    pub query: Option<String>,
}

impl PathInfo {
    pub fn new(name: impl Into<String>, phys: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            phys: phys.into(),
            query: None,
        }
    }
}

/// One entry of the host's per-request variable feed.
///
/// A `None` value marks a variable the host knows about but cannot fill for this
/// request. An entry with an empty name terminates the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessVar {
    pub name: String,
    pub value: Option<String>,
}

impl ProcessVar {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn sentinel() -> Self {
        Self {
            name: String::new(),
            value: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.name.is_empty()
    }
}

/// Request data the bridge needs from a client handle.
pub trait HostClient {
    /// Protocol version as numbered by the host: 0 = HTTP/0.9, 1 = HTTP/1.0, 2 = HTTP/1.1.
    fn protocol_version(&self) -> u8;
}

/// Entry point run inside the isolated process.
///
/// `out` is the process output stream, i.e. the raw response. The host terminates
/// the process with status 0 once the entry returns.
pub type ProcessEntry<'a, C> = Box<dyn FnOnce(&mut C, &mut PathInfo, &str, &mut dyn Write) + 'a>;

pub trait Host {
    type Client: HostClient;

    /// Whether `url` falls under `prefix`.
    fn path_match(&self, prefix: &str, url: &str) -> bool;

    /// Runs `entry` in a freshly isolated process. An error means no process was created.
    fn create_process(
        &self,
        client: &mut Self::Client,
        path_info: &PathInfo,
        url: &str,
        entry: ProcessEntry<'_, Self::Client>,
    ) -> io::Result<()>;

    /// Reports a failure straight to the client connection.
    fn client_error(&self, client: &mut Self::Client, code: u16, title: &str, message: &str);

    /// Generic per-request variables, terminated by [`ProcessVar::sentinel`].
    fn get_process_vars(&self, client: &Self::Client, path_info: &PathInfo) -> Vec<ProcessVar>;
}

/// A URL check plus request handler registered with the host's dispatch table.
pub trait DispatchHandler<H: Host> {
    fn check_url(&self, host: &H, url: &str) -> bool;

    fn handle_request(&self, host: &H, client: &mut H::Client, url: &str);
}

pub trait Dispatcher<H: Host> {
    fn dispatch_add(&mut self, handler: Box<dyn DispatchHandler<H>>);
}

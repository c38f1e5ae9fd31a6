//! The process-wide Lua runtime that serves every request.
//!
//! The runtime is created once at startup: the standard library is opened, the
//! `uhttpd` capability table is installed, and the handler script's top level runs
//! exactly once. Each request then calls the script's `handle_request(env)` inside
//! its own isolated process, so nothing a request does survives into the next one.
//!
//! Scripts see:
//!
//! ```lua
//! uhttpd.send(...)        -- print; writes to the response stream
//! uhttpd.sendc(...)       -- same as send, chunking is the server's business
//! uhttpd.recv(max_len)    -- length, data  (length alone when <= 0)
//! uhttpd.urlencode(s)
//! uhttpd.urldecode(s)
//! uhttpd.docroot          -- configured document root
//! ```

use std::path::Path;

use mlua::{Function, Lua, MultiValue, Table, Value};

use crate::body::{self, FdSource, Received};
use crate::config::Config;
use crate::env::{EnvValue, RequestEnv};
use crate::error::{lua_error_text, BridgeError, HandlerError, InitPhase};
use crate::urlcodec::{self, Transform};

/// Global name of the host capability table.
pub const API_TABLE: &str = "uhttpd";

/// Global function every handler script must define.
pub const HANDLER_CALLBACK: &str = "handle_request";

/// A pluggable request handler: consumes the request environment and writes the
/// response to the process output stream.
pub trait RequestHandler {
    fn handle(&self, env: &RequestEnv) -> Result<(), HandlerError>;
}

pub struct LuaRuntime {
    lua: Lua,
}

impl LuaRuntime {
    // Intent: build the single Lua state, install the uhttpd table, and run the handler
    // script's top level once.
    // Result: a runtime whose globals hold a callable handle_request, or a startup error
    // naming the phase that failed.
    pub fn initialize(config: &Config) -> Result<Self, BridgeError> {
        // SAFETY: scripts get the full standard library, debug and C module loading
        // included; the isolated process is the only boundary they run behind.
        let lua = unsafe { Lua::unsafe_new() };
        install_api(&lua, config)?;

        let path = config.lua_handler.as_path();
        let main = load_handler(&lua, path)?;
        main.call::<()>(()).map_err(|err| BridgeError::Load {
            phase: InitPhase::Initializing,
            message: lua_error_text(&err),
        })?;

        match lua.globals().get::<Value>(HANDLER_CALLBACK)? {
            Value::Function(_) => {}
            _ => return Err(BridgeError::MissingCallback),
        }

        tracing::debug!(handler = %path.display(), "lua handler initialized");
        Ok(Self { lua })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    fn env_table(&self, env: &RequestEnv) -> mlua::Result<Table> {
        let table = self.lua.create_table()?;
        for (name, value) in env.iter() {
            match value {
                EnvValue::Text(text) => table.set(name, self.lua.create_string(text)?)?,
                EnvValue::Number(number) => table.set(name, *number)?,
            }
        }
        Ok(table)
    }
}

impl RequestHandler for LuaRuntime {
    fn handle(&self, env: &RequestEnv) -> Result<(), HandlerError> {
        // resolved per call, the script may have rebound it
        let callback = match self.lua.globals().get::<Value>(HANDLER_CALLBACK) {
            Ok(Value::Function(callback)) => callback,
            Ok(other) => {
                return Err(HandlerError::runtime(format!(
                    "attempt to call a {} value (global '{}')",
                    other.type_name(),
                    HANDLER_CALLBACK
                )))
            }
            Err(err) => return Err(HandlerError::from(&err)),
        };

        let table = self.env_table(env).map_err(|err| HandlerError::from(&err))?;
        callback
            .call::<()>(table)
            .map_err(|err| HandlerError::from(&err))
    }
}

fn load_handler(lua: &Lua, path: &Path) -> Result<Function, BridgeError> {
    let source = std::fs::read(path).map_err(|err| BridgeError::Load {
        phase: InitPhase::Loading,
        message: format!("cannot open {}: {err}", path.display()),
    })?;

    lua.load(source.as_slice())
        .set_name(format!("@{}", path.display()))
        .into_function()
        .map_err(|err| BridgeError::Load {
            phase: InitPhase::Loading,
            message: lua_error_text(&err),
        })
}

fn install_api(lua: &Lua, config: &Config) -> mlua::Result<()> {
    let api = lua.create_table()?;

    // chunked transfer is handled by the server reading our output
    let print: Function = lua.globals().get("print")?;
    api.set("send", print.clone())?;
    api.set("sendc", print)?;

    api.set("recv", lua.create_function(lua_recv)?)?;
    api.set("urldecode", string_converter(lua, urlcodec::urldecode)?)?;
    api.set("urlencode", string_converter(lua, urlcodec::urlencode)?)?;
    api.set("docroot", config.docroot_display())?;

    lua.globals().set(API_TABLE, api)
}

fn lua_recv(lua: &Lua, max_len: mlua::Number) -> mlua::Result<MultiValue> {
    let mut source = FdSource::stdin();
    recv_values(lua, body::recv(&mut source, max_len as i64))
}

/// Lua results of `recv`: the length, followed by the data only when bytes were read.
fn recv_values(lua: &Lua, received: Received) -> mlua::Result<MultiValue> {
    let mut values = vec![Value::Integer(received.length)];
    if received.length > 0 {
        values.push(Value::String(lua.create_string(&received.data)?));
    }
    Ok(values.into_iter().collect())
}

fn string_converter(lua: &Lua, transform: Transform) -> mlua::Result<Function> {
    lua.create_function(move |lua, input: mlua::String| {
        let converted = urlcodec::convert(transform, &input.as_bytes())
            .map_err(|err| mlua::Error::RuntimeError(err.to_string()))?;
        lua.create_string(&converted)
    })
}

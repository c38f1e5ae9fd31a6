//! `uhttpd-lua`: serve a Lua request handler over HTTP.
//!
//! Logs go to standard error; filter with `RUST_LOG` (default `info`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uhttpd_lua::config::DEFAULT_LUA_PREFIX;
use uhttpd_lua::{lua_plugin_init, Config, Server};

#[derive(Parser, Debug)]
#[command(name = "uhttpd-lua")]
#[command(version, about = "HTTP server running a Lua handler per request", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short = 'p', long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Document root exposed to the handler as uhttpd.docroot
    #[arg(short, long, default_value = ".")]
    docroot: PathBuf,

    /// Lua script defining handle_request(env)
    #[arg(short = 'L', long, value_name = "FILE")]
    lua_handler: PathBuf,

    /// URL prefix routed to the Lua handler
    #[arg(short = 'l', long, value_name = "PREFIX", default_value = DEFAULT_LUA_PREFIX)]
    lua_prefix: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::new(args.docroot, args.lua_handler).with_prefix(args.lua_prefix);

    let mut server = match Server::bind(args.listen, &config.docroot) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(addr = %args.listen, error = %err, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };
    lua_plugin_init(server.host_mut(), &config);

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server loop failed");
            ExitCode::FAILURE
        }
    }
}

use std::io::{self, Write};

use crate::config::Config;
use crate::env::build_request_env;
use crate::error::BridgeError;
use crate::host::{DispatchHandler, Dispatcher, Host, HostClient, PathInfo, ProcessEntry};
use crate::response::write_handler_failure;
use crate::runtime::{LuaRuntime, RequestHandler};

/// Dispatch entry routing the configured prefix to a request handler, one isolated
/// process per request.
pub struct LuaDispatch<R> {
    config: Config,
    handler: R,
}

impl<R: RequestHandler> LuaDispatch<R> {
    pub fn new(config: Config, handler: R) -> Self {
        Self { config, handler }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl LuaDispatch<LuaRuntime> {
    pub fn from_config(config: &Config) -> Result<Self, BridgeError> {
        config.validate()?;
        let runtime = LuaRuntime::initialize(config)?;
        Ok(Self::new(config.clone(), runtime))
    }
}

impl<H: Host, R: RequestHandler> DispatchHandler<H> for LuaDispatch<R> {
    fn check_url(&self, host: &H, url: &str) -> bool {
        host.path_match(&self.config.lua_prefix, url)
    }

    // Intent: hand a matched request to a fresh process running the handler.
    // Result: the process writes the response; if none could be created the client gets a 500.
    fn handle_request(&self, host: &H, client: &mut H::Client, url: &str) {
        let path_info = PathInfo::new(
            self.config.lua_prefix.as_str(),
            self.config.lua_handler.as_path(),
        );

        let entry: ProcessEntry<'_, H::Client> = Box::new(
            move |client: &mut H::Client, path_info: &mut PathInfo, url: &str, out: &mut dyn Write| {
                run_handler(host, &self.config, &self.handler, client, path_info, url, out)
            },
        );

        if let Err(err) = host.create_process(client, &path_info, url, entry) {
            tracing::warn!(url, error = %err, "failed to create handler process");
            host.client_error(
                client,
                500,
                "Internal Server Error",
                &format!("Failed to create CGI process: {err}"),
            );
        }
    }
}

// Intent: the body of the isolated process, building the environment and calling the handler.
// Result: handler output is the response; a failed call is replaced by a 500 block.
pub fn run_handler<H: Host, R: RequestHandler>(
    host: &H,
    config: &Config,
    handler: &R,
    client: &mut H::Client,
    path_info: &mut PathInfo,
    url: &str,
    out: &mut dyn Write,
) {
    let version = client.protocol_version();
    let env = build_request_env(&config.lua_prefix, url, version, path_info, |pi| {
        host.get_process_vars(client, pi)
    });

    if let Err(err) = handler.handle(&env) {
        let os_error = io::Error::last_os_error();
        tracing::debug!(url, error = %err, "lua handler failed");
        if let Err(write_err) = write_handler_failure(out, &path_info.phys, &os_error, &err) {
            tracing::debug!(error = %write_err, "failed to write handler failure response");
        }
    }
}

/// Creates the Lua runtime and registers the dispatch entry with the host.
///
/// A handler script that cannot be loaded can never serve a request, so this prints the
/// startup error and terminates the process with status 1.
pub fn lua_plugin_init<H>(host: &mut H, config: &Config)
where
    H: Host + Dispatcher<H>,
{
    let dispatch = match LuaDispatch::from_config(config) {
        Ok(dispatch) => dispatch,
        Err(err) => {
            tracing::error!(handler = %config.lua_handler.display(), "lua handler unusable");
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    tracing::info!(prefix = %config.lua_prefix, handler = %config.lua_handler.display(), "lua handler registered");
    host.dispatch_add(Box::new(dispatch));
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use tempfile::NamedTempFile;

    use super::*;
    use crate::env::RequestEnv;
    use crate::error::HandlerError;
    use crate::host::ProcessVar;

    #[derive(Default)]
    struct FakeClient {
        version: u8,
        errors: Vec<(u16, String, String)>,
        output: Vec<u8>,
    }

    impl HostClient for FakeClient {
        fn protocol_version(&self) -> u8 {
            self.version
        }
    }

    #[derive(Default)]
    struct FakeHost {
        refuse_processes: bool,
        spawned: Cell<usize>,
    }

    impl Host for FakeHost {
        type Client = FakeClient;

        fn path_match(&self, prefix: &str, url: &str) -> bool {
            url.starts_with(prefix)
        }

        fn create_process(
            &self,
            client: &mut FakeClient,
            path_info: &PathInfo,
            url: &str,
            entry: ProcessEntry<'_, FakeClient>,
        ) -> io::Result<()> {
            if self.refuse_processes {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            self.spawned.set(self.spawned.get() + 1);
            let mut path_info = path_info.clone();
            let mut out = Vec::new();
            entry(client, &mut path_info, url, &mut out);
            client.output = out;
            Ok(())
        }

        fn client_error(&self, client: &mut FakeClient, code: u16, title: &str, message: &str) {
            client.errors.push((code, title.to_string(), message.to_string()));
        }

        fn get_process_vars(&self, _client: &FakeClient, path_info: &PathInfo) -> Vec<ProcessVar> {
            vec![
                ProcessVar::new("SCRIPT_NAME", Some(path_info.name.clone())),
                ProcessVar::new(
                    "QUERY_STRING",
                    path_info.query.as_deref().map(|q| q.trim_start_matches('?').to_string()),
                ),
                ProcessVar::sentinel(),
            ]
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: RefCell<Vec<RequestEnv>>,
        fail_with: Option<HandlerError>,
    }

    impl RequestHandler for Recording {
        fn handle(&self, env: &RequestEnv) -> Result<(), HandlerError> {
            self.seen.borrow_mut().push(env.clone());
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn config() -> Config {
        Config::new("/www", "/www/handler.lua").with_prefix("/lua/")
    }

    #[test]
    fn process_failure_reports_500_without_spawning() {
        let host = FakeHost {
            refuse_processes: true,
            ..FakeHost::default()
        };
        let dispatch = LuaDispatch::new(config(), Recording::default());
        let mut client = FakeClient::default();

        dispatch.handle_request(&host, &mut client, "/lua/app");

        assert_eq!(host.spawned.get(), 0);
        assert!(dispatch.handler.seen.borrow().is_empty());
        assert_eq!(client.errors.len(), 1);
        let (code, title, message) = &client.errors[0];
        assert_eq!(*code, 500);
        assert_eq!(title, "Internal Server Error");
        assert!(message.starts_with("Failed to create CGI process: "));
    }

    #[test]
    fn handler_sees_merged_environment() {
        let host = FakeHost::default();
        let dispatch = LuaDispatch::new(config(), Recording::default());
        let mut client = FakeClient {
            version: 2,
            ..FakeClient::default()
        };

        dispatch.handle_request(&host, &mut client, "/lua/app?x=1");

        assert_eq!(host.spawned.get(), 1);
        let seen = dispatch.handler.seen.borrow();
        let env = &seen[0];
        assert_eq!(env.text("PATH_INFO"), Some("app"));
        assert_eq!(env.text("SCRIPT_NAME"), Some("/lua/"));
        assert_eq!(env.text("QUERY_STRING"), Some("x=1"));
        assert_eq!(env.number("HTTP_VERSION"), Some(0.9 + 2.0 / 10.0));
        assert!(client.output.is_empty());
        assert!(client.errors.is_empty());
    }

    #[test]
    fn handler_failure_is_translated() {
        let host = FakeHost::default();
        let handler = Recording {
            fail_with: Some(HandlerError::runtime("kaput")),
            ..Recording::default()
        };
        let dispatch = LuaDispatch::new(config(), handler);
        let mut client = FakeClient::default();

        dispatch.handle_request(&host, &mut client, "/lua/app");

        let output = String::from_utf8(client.output).expect("utf8");
        assert!(output.starts_with("Status: 500 Internal Server Error"));
        assert!(output.contains("/www/handler.lua"));
        assert!(output.contains("kaput"));
        assert!(client.errors.is_empty());
    }

    #[test]
    fn check_url_uses_configured_prefix() {
        let host = FakeHost::default();
        let dispatch = LuaDispatch::new(config(), Recording::default());
        assert!(DispatchHandler::<FakeHost>::check_url(&dispatch, &host, "/lua/x"));
        assert!(!DispatchHandler::<FakeHost>::check_url(&dispatch, &host, "/cgi-bin/x"));
    }

    #[test]
    fn lua_handler_error_names_script() {
        let mut script = NamedTempFile::new().expect("script");
        script
            .write_all(b"function handle_request(env) error('no ' .. env.PATH_INFO) end")
            .expect("write");
        let config = Config::new("/www", script.path()).with_prefix("/lua");
        let dispatch = LuaDispatch::from_config(&config).expect("dispatch");
        let host = FakeHost::default();
        let mut client = FakeClient::default();

        dispatch.handle_request(&host, &mut client, "/lua/thing");

        let output = String::from_utf8(client.output).expect("utf8");
        assert!(output.starts_with("Status: 500 Internal Server Error"));
        assert!(output.contains(&script.path().display().to_string()));
        assert!(output.contains("no /thing"));
    }

    #[test]
    fn from_config_rejects_bad_prefix() {
        let config = Config::new("/www", "/www/handler.lua").with_prefix("lua");
        assert!(matches!(
            LuaDispatch::from_config(&config),
            Err(BridgeError::InvalidConfig(_))
        ));
    }
}

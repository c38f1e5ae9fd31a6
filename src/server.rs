//! Single-threaded reference host: a mio event loop that parses requests, runs the
//! dispatch table, and relays the output of per-request processes to clients.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::unix::pipe::{self, Receiver, Sender};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::cgi::{plain_response, process_vars, translate_head, CgiContext, CgiHead};
use crate::host::{DispatchHandler, Dispatcher, Host, HostClient, PathInfo, ProcessEntry, ProcessVar};
use crate::request::{parse_request, read_available, ParsedRequest};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: usize = 2;
const TOKENS_PER_CONN: usize = 3;
const REAP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Socket,
    Stdout,
    Stdin,
}

fn conn_token(index: usize, slot: Slot) -> Token {
    let offset = match slot {
        Slot::Socket => 0,
        Slot::Stdout => 1,
        Slot::Stdin => 2,
    };
    Token(FIRST_CONN + index * TOKENS_PER_CONN + offset)
}

fn split_token(token: Token) -> (usize, Slot) {
    let raw = token.0 - FIRST_CONN;
    let slot = match raw % TOKENS_PER_CONN {
        0 => Slot::Socket,
        1 => Slot::Stdout,
        _ => Slot::Stdin,
    };
    (raw / TOKENS_PER_CONN, slot)
}

struct Outgoing {
    data: Vec<u8>,
    offset: usize,
}

/// Parent-side state of the process serving a connection.
struct ChildProcess {
    pid: libc::pid_t,
    stdout: Option<Receiver>,
    stdin: Option<Sender>,
    stdin_data: Vec<u8>,
    stdin_offset: usize,
    head: Vec<u8>,
    head_sent: bool,
}

pub struct Connection {
    index: usize,
    stream: TcpStream,
    buffer: Vec<u8>,
    outgoing: VecDeque<Outgoing>,
    close_after_write: bool,
    /// The peer shut down its sending side after the request arrived.
    read_closed: bool,
    /// Whether the socket is currently registered with the poll.
    registered: bool,
    request: Option<ParsedRequest>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    process: Option<ChildProcess>,
}

impl Connection {
    fn http_minor(&self) -> u8 {
        self.request.as_ref().map(|request| request.version).unwrap_or(0)
    }

    fn push_outgoing(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.outgoing.push_back(Outgoing { data, offset: 0 });
        }
    }

    fn finished(&self) -> bool {
        self.close_after_write
            && self.outgoing.is_empty()
            && self
                .process
                .as_ref()
                .map_or(true, |process| process.stdout.is_none())
    }

    fn interest(&self) -> Option<Interest> {
        match (self.read_closed, self.outgoing.is_empty()) {
            (false, true) => Some(Interest::READABLE),
            (false, false) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::WRITABLE),
            (true, true) => None,
        }
    }
}

impl HostClient for Connection {
    fn protocol_version(&self) -> u8 {
        self.request
            .as_ref()
            .map(ParsedRequest::protocol_version)
            .unwrap_or(1)
    }
}

/// The [`Host`] side of the server: process creation, error reporting, and the
/// dispatch table.
pub struct ServerHost {
    registry: Registry,
    docroot: PathBuf,
    handlers: Vec<Box<dyn DispatchHandler<ServerHost>>>,
}

impl ServerHost {
    fn dispatch(&self, connection: &mut Connection) {
        let Some(url) = connection.request.as_ref().map(|request| request.path.clone()) else {
            return;
        };
        tracing::debug!(url = %url, "dispatching request");

        for handler in &self.handlers {
            if handler.check_url(self, &url) {
                handler.handle_request(self, connection, &url);
                return;
            }
        }
        self.client_error(
            connection,
            404,
            "Not Found",
            &format!("The requested URL {url} was not found on this server."),
        );
    }
}

impl Dispatcher<ServerHost> for ServerHost {
    fn dispatch_add(&mut self, handler: Box<dyn DispatchHandler<ServerHost>>) {
        self.handlers.push(handler);
    }
}

impl Host for ServerHost {
    type Client = Connection;

    fn path_match(&self, prefix: &str, url: &str) -> bool {
        path_match(prefix, url)
    }

    // Intent: fork a process for one request with the body on stdin and the response on stdout.
    // Result: the parent keeps the pipe ends on the connection and relays them through the
    // event loop; the child runs the entry and exits with status 0.
    fn create_process(
        &self,
        client: &mut Connection,
        path_info: &PathInfo,
        url: &str,
        entry: ProcessEntry<'_, Connection>,
    ) -> io::Result<()> {
        let (stdin_tx, stdin_rx) = pipe::new()?;
        let (stdout_tx, mut stdout_rx) = pipe::new()?;
        stdout_tx.set_nonblocking(false)?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            drop(stdin_tx);
            drop(stdout_rx);
            run_child(client, path_info, url, entry, stdin_rx, stdout_tx);
        }

        drop(stdin_rx);
        drop(stdout_tx);
        tracing::debug!(pid, url, "spawned handler process");

        self.registry.register(
            &mut stdout_rx,
            conn_token(client.index, Slot::Stdout),
            Interest::READABLE,
        )?;

        let stdin_data = client
            .request
            .as_ref()
            .map(|request| request.body.clone())
            .unwrap_or_default();
        let stdin = if stdin_data.is_empty() {
            drop(stdin_tx);
            None
        } else {
            let mut stdin_tx = stdin_tx;
            self.registry.register(
                &mut stdin_tx,
                conn_token(client.index, Slot::Stdin),
                Interest::WRITABLE,
            )?;
            Some(stdin_tx)
        };

        client.process = Some(ChildProcess {
            pid,
            stdout: Some(stdout_rx),
            stdin,
            stdin_data,
            stdin_offset: 0,
            head: Vec::new(),
            head_sent: false,
        });
        Ok(())
    }

    fn client_error(&self, client: &mut Connection, code: u16, title: &str, message: &str) {
        tracing::debug!(code, title, "reporting client error");
        let response = plain_response(client.http_minor(), code, title, message);
        client.push_outgoing(response);
        client.close_after_write = true;
    }

    fn get_process_vars(&self, client: &Connection, path_info: &PathInfo) -> Vec<ProcessVar> {
        let Some(request) = client.request.as_ref() else {
            return vec![ProcessVar::sentinel()];
        };
        let ctx = CgiContext {
            request,
            docroot: &self.docroot,
            local_addr: client.local_addr,
            remote_addr: client.remote_addr,
        };
        process_vars(&ctx, path_info)
    }
}

/// Whether `url` lies under `prefix`. `/` matches everything; otherwise the prefix must
/// be followed by `/`, `?`, or the end of the URL unless it already ends in `/`.
pub fn path_match(prefix: &str, url: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let Some(rest) = url.strip_prefix(prefix) else {
        return false;
    };
    prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')
}

/// Standard output of the isolated process. C stdio is flushed before every write so
/// bytes printed by the script keep their place ahead of ours.
struct ProcessStdout;

impl Write for ProcessStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        unsafe { libc::fflush(std::ptr::null_mut()) };
        let written = unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(written as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        unsafe { libc::fflush(std::ptr::null_mut()) };
        Ok(())
    }
}

fn run_child(
    client: &mut Connection,
    path_info: &PathInfo,
    url: &str,
    entry: ProcessEntry<'_, Connection>,
    stdin: Receiver,
    stdout: Sender,
) -> ! {
    let redirected = unsafe {
        libc::dup2(stdin.as_raw_fd(), libc::STDIN_FILENO) >= 0
            && libc::dup2(stdout.as_raw_fd(), libc::STDOUT_FILENO) >= 0
    };
    drop(stdin);
    drop(stdout);
    if !redirected {
        unsafe { libc::_exit(1) };
    }
    close_inherited_fds();

    let mut path_info = path_info.clone();
    let mut out = ProcessStdout;
    entry(client, &mut path_info, url, &mut out);
    let _ = out.flush();
    unsafe { libc::_exit(0) }
}

/// First descriptor above standard input, output and error.
const FIRST_INHERITED_FD: libc::c_int = 3;

// Intent: drop every descriptor the child inherited from the server.
// Result: other clients' sockets, the listener and sibling pipes stay owned by the parent
// alone, so their EOFs never wait on this process.
fn close_inherited_fds() {
    #[cfg(target_os = "linux")]
    {
        let closed = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                FIRST_INHERITED_FD as libc::c_uint,
                libc::c_uint::MAX,
                0 as libc::c_uint,
            )
        };
        if closed == 0 {
            return;
        }
    }

    let listed: Option<Vec<libc::c_int>> = std::fs::read_dir("/dev/fd").ok().map(|entries| {
        entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect()
    });
    let fds = match listed {
        Some(fds) => fds,
        None => {
            let mut limit = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            let max = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
                limit.rlim_cur.min(65536) as libc::c_int
            } else {
                1024
            };
            (FIRST_INHERITED_FD..max).collect()
        }
    };
    for fd in fds.into_iter().filter(|fd| *fd >= FIRST_INHERITED_FD) {
        unsafe { libc::close(fd) };
    }
}

fn reap_children() {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        tracing::debug!(pid, status, "handler process exited");
    }
}

fn write_outgoing(connection: &mut Connection) -> io::Result<()> {
    while let Some(front) = connection.outgoing.front_mut() {
        match connection.stream.write(&front.data[front.offset..]) {
            Ok(0) => break,
            Ok(written) => {
                front.offset += written;
                if front.offset >= front.data.len() {
                    connection.outgoing.pop_front();
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn feed_process_input(registry: &Registry, connection: &mut Connection) {
    let Some(process) = connection.process.as_mut() else {
        return;
    };
    let Some(stdin) = process.stdin.as_mut() else {
        return;
    };

    let done = loop {
        if process.stdin_offset >= process.stdin_data.len() {
            break true;
        }
        match stdin.write(&process.stdin_data[process.stdin_offset..]) {
            Ok(written) => process.stdin_offset += written,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break false,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(pid = process.pid, error = %err, "handler stopped reading its body");
                break true;
            }
        }
    };

    if done {
        if let Some(mut stdin) = process.stdin.take() {
            let _ = registry.deregister(&mut stdin);
        }
    }
}

// Intent: move process output to the client, translating the CGI header block first.
// Result: the response head and body are queued; EOF or a bad head ends the relay.
fn relay_process_output(registry: &Registry, connection: &mut Connection) {
    let minor = connection.http_minor();
    let Some(process) = connection.process.as_mut() else {
        return;
    };
    let Some(stdout) = process.stdout.as_mut() else {
        return;
    };

    let mut chunk = Vec::new();
    let (eof, read_failed) = match read_available(stdout, &mut chunk) {
        Ok(eof) => (eof, false),
        Err(err) => {
            tracing::debug!(pid = process.pid, error = %err, "reading handler output failed");
            (true, true)
        }
    };

    let mut queued = Vec::new();
    let mut finished = eof;
    if process.head_sent {
        queued.push(chunk);
    } else {
        process.head.extend_from_slice(&chunk);
        match translate_head(&process.head, minor) {
            CgiHead::Complete { head, body_offset } => {
                let body = process.head.split_off(body_offset);
                process.head.clear();
                process.head_sent = true;
                queued.push(head);
                queued.push(body);
            }
            CgiHead::Partial if !eof => {}
            CgiHead::Partial | CgiHead::Invalid => {
                if !read_failed {
                    tracing::warn!(pid = process.pid, "handler produced no valid response header");
                }
                queued.push(plain_response(
                    minor,
                    502,
                    "Bad Gateway",
                    "The process did not produce any response",
                ));
                finished = true;
            }
        }
    }

    if finished {
        if let Some(mut stdout) = process.stdout.take() {
            let _ = registry.deregister(&mut stdout);
        }
        if let Some(mut stdin) = process.stdin.take() {
            let _ = registry.deregister(&mut stdin);
        }
        connection.close_after_write = true;
    }
    for data in queued {
        connection.push_outgoing(data);
    }
}

// Intent: read request bytes and dispatch once a full request is buffered.
// Result: Ok(true) only when the peer left before completing a request; a half-close
// after the request just stops reading so the response can still be delivered.
fn handle_readable(host: &ServerHost, connection: &mut Connection) -> io::Result<bool> {
    if connection.request.is_some() {
        let mut discard = Vec::new();
        connection.read_closed = read_available(&mut connection.stream, &mut discard)?;
        return Ok(false);
    }

    let eof = read_available(&mut connection.stream, &mut connection.buffer)?;
    match parse_request(&mut connection.buffer) {
        Ok(Some(request)) => {
            connection.request = Some(request);
            connection.read_closed = eof;
            host.dispatch(connection);
            Ok(false)
        }
        Ok(None) => Ok(eof),
        Err(err) => {
            tracing::debug!(error = %err, "rejecting malformed request");
            host.client_error(connection, 400, "Bad Request", "Malformed request");
            connection.request = None;
            connection.read_closed = eof;
            Ok(false)
        }
    }
}

fn update_interest(registry: &Registry, connection: &mut Connection) -> io::Result<()> {
    let token = conn_token(connection.index, Slot::Socket);
    match (connection.interest(), connection.registered) {
        (Some(interest), true) => registry.reregister(&mut connection.stream, token, interest),
        (Some(interest), false) => {
            registry.register(&mut connection.stream, token, interest)?;
            connection.registered = true;
            Ok(())
        }
        (None, true) => {
            connection.registered = false;
            registry.deregister(&mut connection.stream)
        }
        (None, false) => Ok(()),
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    host: ServerHost,
    connections: Vec<Option<Connection>>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(addr: SocketAddr, docroot: impl AsRef<Path>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            poll,
            listener,
            host: ServerHost {
                registry,
                docroot: docroot.as_ref().to_path_buf(),
                handlers: Vec::new(),
            },
            connections: Vec::new(),
            waker,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn host_mut(&mut self) -> &mut ServerHost {
        &mut self.host
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: Arc::clone(&self.waker),
            stop: Arc::clone(&self.stop),
        }
    }

    fn accept(&mut self) -> io::Result<()> {
        loop {
            let (mut stream, remote_addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            };
            let index = self
                .connections
                .iter()
                .position(Option::is_none)
                .unwrap_or(self.connections.len());
            self.host.registry.register(
                &mut stream,
                conn_token(index, Slot::Socket),
                Interest::READABLE,
            )?;
            let connection = Connection {
                index,
                local_addr: stream.local_addr().ok(),
                remote_addr: Some(remote_addr),
                stream,
                buffer: Vec::new(),
                outgoing: VecDeque::new(),
                close_after_write: false,
                read_closed: false,
                registered: true,
                request: None,
                process: None,
            };
            if index == self.connections.len() {
                self.connections.push(Some(connection));
            } else {
                self.connections[index] = Some(connection);
            }
        }
    }

    fn connection_event(&mut self, token: Token, readable: bool, writable: bool) -> io::Result<()> {
        let (index, slot) = split_token(token);
        let registry = &self.host.registry;
        let Some(Some(connection)) = self.connections.get_mut(index) else {
            return Ok(());
        };

        let mut closed = false;
        match slot {
            Slot::Socket => {
                if readable && !connection.read_closed {
                    match handle_readable(&self.host, connection) {
                        Ok(abandoned) => closed = abandoned,
                        Err(err) => {
                            tracing::debug!(error = %err, "connection read failed");
                            closed = true;
                        }
                    }
                }
                if writable {
                    if let Err(err) = write_outgoing(connection) {
                        tracing::debug!(error = %err, "connection write failed");
                        closed = true;
                    }
                }
            }
            Slot::Stdout => relay_process_output(registry, connection),
            Slot::Stdin => feed_process_input(registry, connection),
        }

        if !closed && !connection.outgoing.is_empty() {
            if let Err(err) = write_outgoing(connection) {
                tracing::debug!(error = %err, "connection write failed");
                closed = true;
            }
        }

        if closed || connection.finished() {
            self.connections[index] = None;
            return Ok(());
        }

        update_interest(registry, connection)
    }

    // Intent: run the event loop until a ServerHandle asks it to stop.
    // Result: requests are dispatched, process output is relayed, and children are reaped.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        tracing::info!(addr = ?self.local_addr().ok(), "server listening");

        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, Some(REAP_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept()?,
                    WAKER => {}
                    token => self.connection_event(
                        token,
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    )?,
                }
            }
            reap_children();
        }

        tracing::info!("server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching() {
        assert!(path_match("/", "/anything"));
        assert!(path_match("/lua", "/lua"));
        assert!(path_match("/lua", "/lua/app"));
        assert!(path_match("/lua", "/lua?x=1"));
        assert!(!path_match("/lua", "/luascript"));
        assert!(!path_match("/lua", "/cgi-bin/lua"));
        assert!(path_match("/lua/", "/lua/app"));
        assert!(!path_match("/lua/", "/lua"));
    }

    #[test]
    fn tokens_round_trip() {
        for index in [0, 1, 7] {
            for slot in [Slot::Socket, Slot::Stdout, Slot::Stdin] {
                assert_eq!(split_token(conn_token(index, slot)), (index, slot));
            }
        }
        assert_ne!(conn_token(0, Slot::Socket), WAKER);
    }
}

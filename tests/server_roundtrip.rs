use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use uhttpd_lua::{lua_plugin_init, Config, Server, ServerHandle};

const HANDLER: &str = r#"
function handle_request(env)
  if env.PATH_INFO == "/fail" then
    error("handler exploded")
  end
  if env.PATH_INFO == "/slow" then
    local started = os.clock()
    while os.clock() - started < 2 do end
  end

  local body = ""
  if env.REQUEST_METHOD == "POST" then
    local n, data = uhttpd.recv(1024)
    while n > 0 do
      body = body .. data
      n, data = uhttpd.recv(1024)
    end
  end

  io.write("Status: 201 Created\r\n")
  io.write("Content-Type: text/plain\r\n")
  io.write("X-Version: ", tostring(env.HTTP_VERSION), "\r\n\r\n")
  io.write("path=", env.PATH_INFO or "", "\n")
  io.write("query=", env.QUERY_STRING or "", "\n")
  io.write("decoded=", uhttpd.urldecode(env.QUERY_STRING or ""), "\n")
  io.write("docroot=", uhttpd.docroot, "\n")
  io.write("body=", body, "\n")
end
"#;

struct Running {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: thread::JoinHandle<std::io::Result<()>>,
}

impl Running {
    fn stop(self) {
        self.handle.shutdown().expect("shutdown");
        self.thread.join().expect("join").expect("server run");
    }
}

fn start(script: PathBuf) -> Running {
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let config = Config::new("/srv/www", script).with_prefix("/lua");
        let mut server = Server::bind("127.0.0.1:0".parse().expect("addr"), &config.docroot)?;
        lua_plugin_init(server.host_mut(), &config);
        tx.send((server.local_addr()?, server.handle()))
            .expect("send handle");
        server.run()
    });
    let (addr, handle) = rx.recv().expect("server started");
    Running {
        addr,
        handle,
        thread,
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("timeout");
    stream
}

fn read_response(mut stream: TcpStream) -> String {
    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = connect(addr);
    stream.write_all(request).expect("write request");
    read_response(stream)
}

fn handler_script() -> NamedTempFile {
    let mut script = NamedTempFile::new().expect("script");
    script.write_all(HANDLER.as_bytes()).expect("write script");
    script
}

#[test]
fn handler_response_is_relayed() {
    let script = handler_script();
    let server = start(script.path().to_path_buf());

    let response = exchange(
        server.addr,
        b"GET /lua/items?name=a%20b HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{response}");
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.contains("X-Version: 1.1"));
    assert!(response.contains("path=/items\n"));
    assert!(response.contains("query=name=a%20b\n"));
    assert!(response.contains("decoded=name=a b\n"));
    assert!(response.contains("docroot=/srv/www\n"));

    server.stop();
}

#[test]
fn post_body_reaches_recv() {
    let script = handler_script();
    let server = start(script.path().to_path_buf());

    let response = exchange(
        server.addr,
        b"POST /lua/upload HTTP/1.0\r\nContent-Length: 11\r\n\r\nhello world",
    );
    assert!(response.starts_with("HTTP/1.0 201 Created\r\n"), "{response}");
    assert!(response.contains("X-Version: 1.0"));
    assert!(response.contains("body=hello world\n"));

    server.stop();
}

#[test]
fn handler_error_becomes_500() {
    let script = handler_script();
    let server = start(script.path().to_path_buf());

    let response = exchange(server.addr, b"GET /lua/fail HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(
        response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"),
        "{response}"
    );
    assert!(response.contains("Unable to launch the requested Lua program:"));
    assert!(response.contains(&script.path().display().to_string()));
    assert!(response.contains("handler exploded"));

    server.stop();
}

#[test]
fn unmatched_url_is_not_found() {
    let script = handler_script();
    let server = start(script.path().to_path_buf());

    let response = exchange(server.addr, b"GET /luascript HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");

    server.stop();
}

#[test]
fn half_closed_client_still_gets_response() {
    let script = handler_script();
    let server = start(script.path().to_path_buf());

    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /lua/items HTTP/1.0\r\n\r\n")
        .expect("write request");
    stream.shutdown(Shutdown::Write).expect("half close");
    let response = read_response(stream);
    assert!(response.starts_with("HTTP/1.0 201 Created\r\n"), "{response}");
    assert!(response.contains("path=/items\n"));

    server.stop();
}

#[test]
fn slow_handler_does_not_hold_other_connections() {
    let script = handler_script();
    let server = start(script.path().to_path_buf());

    // open before the slow process forks so its socket exists at fork time
    let mut fast = connect(server.addr);
    fast.write_all(b"GET /lua/fast HTTP/1.0\r\n").expect("partial request");
    thread::sleep(Duration::from_millis(100));

    let mut slow = connect(server.addr);
    slow.write_all(b"GET /lua/slow HTTP/1.0\r\n\r\n")
        .expect("slow request");
    thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    fast.write_all(b"\r\n").expect("finish request");
    let response = read_response(fast);
    let elapsed = started.elapsed();
    assert!(response.contains("path=/fast\n"), "{response}");
    assert!(elapsed < Duration::from_secs(1), "fast response took {elapsed:?}");

    let slow_response = read_response(slow);
    assert!(slow_response.contains("path=/slow\n"), "{slow_response}");

    server.stop();
}

//! CGI plumbing for the reference host: the variable feed handed to scripts and the
//! translation of a process's CGI header block into an HTTP response head.

use std::net::SocketAddr;
use std::path::Path;

use crate::host::{PathInfo, ProcessVar};
use crate::request::ParsedRequest;

const SERVER_SOFTWARE: &str = concat!("uhttpd-lua/", env!("CARGO_PKG_VERSION"));

pub(crate) struct CgiContext<'a> {
    pub(crate) request: &'a ParsedRequest,
    pub(crate) docroot: &'a Path,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

fn var(name: &str, value: impl Into<String>) -> ProcessVar {
    ProcessVar::new(name, Some(value.into()))
}

// Intent: build the CGI/1.1 variable feed for one request.
// Result: the bridge receives name/value pairs ending in the empty-name sentinel; HTTPS
// is listed without a value since the host only speaks plain HTTP.
pub(crate) fn process_vars(ctx: &CgiContext<'_>, path_info: &PathInfo) -> Vec<ProcessVar> {
    let request = ctx.request;
    let query = path_info
        .query
        .as_deref()
        .map(|query| query.trim_start_matches('?'))
        .unwrap_or("");

    let mut vars = vec![
        var("GATEWAY_INTERFACE", "CGI/1.1"),
        var("SERVER_SOFTWARE", SERVER_SOFTWARE),
        var("SCRIPT_NAME", path_info.name.as_str()),
        var("SCRIPT_FILENAME", path_info.phys.to_string_lossy()),
        var("DOCUMENT_ROOT", ctx.docroot.to_string_lossy()),
        var("QUERY_STRING", query),
        var("REQUEST_URI", request.path.as_str()),
        var("REDIRECT_STATUS", "200"),
        var("SERVER_PROTOCOL", format!("HTTP/1.{}", request.version)),
        var("REQUEST_METHOD", request.method.as_str()),
        ProcessVar::new("HTTPS", None),
    ];

    match request.header("Host") {
        Some(host) => {
            let name = host.split(':').next().unwrap_or(host);
            vars.push(var("SERVER_NAME", name));
        }
        None => {
            if let Some(addr) = ctx.local_addr {
                vars.push(var("SERVER_NAME", addr.ip().to_string()));
            }
        }
    }
    if let Some(addr) = ctx.local_addr {
        vars.push(var("SERVER_ADDR", addr.ip().to_string()));
        vars.push(var("SERVER_PORT", addr.port().to_string()));
    }
    if let Some(addr) = ctx.remote_addr {
        vars.push(var("REMOTE_HOST", addr.ip().to_string()));
        vars.push(var("REMOTE_ADDR", addr.ip().to_string()));
        vars.push(var("REMOTE_PORT", addr.port().to_string()));
    }

    vars.push(ProcessVar::new(
        "CONTENT_TYPE",
        request.header("Content-Type").map(str::to_string),
    ));
    vars.push(ProcessVar::new(
        "CONTENT_LENGTH",
        request.header("Content-Length").map(str::to_string),
    ));

    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("Content-Type")
        {
            continue;
        }
        let cgi_name = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        vars.push(var(&cgi_name, value.as_str()));
    }

    vars.push(ProcessVar::sentinel());
    vars
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CgiHead {
    /// The header block has not been fully received yet.
    Partial,
    /// HTTP response head built from the block; the body starts at `body_offset`.
    Complete { head: Vec<u8>, body_offset: usize },
    Invalid,
}

// Intent: turn the CGI header block at the start of process output into an HTTP head.
// Result: Status becomes the status line, other headers pass through, and the connection
// is marked for closing since the body length is unknown.
pub(crate) fn translate_head(output: &[u8], http_minor: u8) -> CgiHead {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let (body_offset, parsed) = match httparse::parse_headers(output, &mut headers) {
        Ok(httparse::Status::Complete(result)) => result,
        Ok(httparse::Status::Partial) => return CgiHead::Partial,
        Err(_) => return CgiHead::Invalid,
    };

    let mut status = None;
    let mut has_location = false;
    let mut passed = Vec::new();
    for header in parsed {
        let value = String::from_utf8_lossy(header.value);
        if header.name.eq_ignore_ascii_case("Status") {
            status = Some(value.trim().to_string());
            continue;
        }
        if header.name.eq_ignore_ascii_case("Connection") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Location") {
            has_location = true;
        }
        passed.push(format!("{}: {}\r\n", header.name, value));
    }

    let status = status.unwrap_or_else(|| {
        if has_location {
            "302 Found".to_string()
        } else {
            "200 OK".to_string()
        }
    });

    let mut head = format!("HTTP/1.{http_minor} {status}\r\n");
    for line in passed {
        head.push_str(&line);
    }
    head.push_str("Connection: close\r\n\r\n");
    CgiHead::Complete {
        head: head.into_bytes(),
        body_offset,
    }
}

/// Complete plain-text response used for errors the host reports itself.
pub(crate) fn plain_response(http_minor: u8, code: u16, title: &str, message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.{http_minor} {code} {title}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{message}",
        message.len()
    )
    .into_bytes()
}

use std::io::{self, Read};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    /// httparse minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    /// Version in the numbering the bridge uses (0.9 = 0, 1.0 = 1, 1.1 = 2).
    pub fn protocol_version(&self) -> u8 {
        self.version + 1
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

// Intent: drain everything currently readable from a non-blocking stream.
// Result: new bytes are appended to buffer; Ok(true) means the peer closed its side.
pub(crate) fn read_available<T: Read>(stream: &mut T, buffer: &mut Vec<u8>) -> io::Result<bool> {
    let mut temp = [0_u8; 4096];
    loop {
        match stream.read(&mut temp) {
            Ok(0) => return Ok(true),
            Ok(read) => buffer.extend_from_slice(&temp[..read]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

fn parse_headers(buffer: &[u8]) -> Result<httparse::Status<(ParsedRequest, usize)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buffer)? {
        httparse::Status::Complete(size) => {
            let header_pairs = request
                .headers
                .iter()
                .map(|header| {
                    (
                        header.name.to_string(),
                        String::from_utf8_lossy(header.value).to_string(),
                    )
                })
                .collect();

            let parsed = ParsedRequest {
                method: request.method.unwrap_or("GET").to_string(),
                path: request.path.unwrap_or("/").to_string(),
                version: request.version.unwrap_or(1),
                headers: header_pairs,
                body: Vec::new(),
            };
            Ok(httparse::Status::Complete((parsed, size)))
        }
        httparse::Status::Partial => Ok(httparse::Status::Partial),
    }
}

pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn find_line_end(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|idx| from + idx)
}

/// Decodes a chunked body starting at `cursor`; `None` until the final chunk arrived.
fn parse_chunked_body(buffer: &[u8], mut cursor: usize) -> io::Result<Option<(Vec<u8>, usize)>> {
    let mut body = Vec::new();
    loop {
        let Some(line_end) = find_line_end(buffer, cursor) else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&buffer[cursor..line_end]);
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
        cursor = line_end + 2;
        if size == 0 {
            // skip trailers up to the blank line
            loop {
                let Some(end) = find_line_end(buffer, cursor) else {
                    return Ok(None);
                };
                let blank = end == cursor;
                cursor = end + 2;
                if blank {
                    return Ok(Some((body, cursor)));
                }
            }
        }
        if buffer.len() < cursor + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buffer[cursor..cursor + size]);
        cursor += size + 2;
    }
}

// Intent: parse one complete HTTP request out of the connection buffer.
// Result: the request with its body is returned and consumed from the buffer, or None
// while more bytes are needed.
pub(crate) fn parse_request(buffer: &mut Vec<u8>) -> io::Result<Option<ParsedRequest>> {
    let (mut request, header_len) = match parse_headers(buffer) {
        Ok(httparse::Status::Complete(result)) => result,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(error) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid request: {error}"),
            ))
        }
    };

    let is_chunked = request
        .header("Transfer-Encoding")
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let (body, consumed) = if is_chunked {
        match parse_chunked_body(buffer, header_len)? {
            Some(result) => result,
            None => return Ok(None),
        }
    } else {
        let content_length = match request.header("Content-Length") {
            Some(value) => value.trim().parse::<usize>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid content length")
            })?,
            None => 0,
        };
        let total_len = header_len + content_length;
        if buffer.len() < total_len {
            return Ok(None);
        }
        (buffer[header_len..total_len].to_vec(), total_len)
    };

    buffer.drain(..consumed);
    request.body = body;
    Ok(Some(request))
}

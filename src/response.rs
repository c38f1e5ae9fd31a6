use std::io::{self, Write};
use std::path::Path;

use crate::error::HandlerError;

pub const FAILURE_HEADER: &str = "Status: 500 Internal Server Error\r\n\r\n";

// Intent: turn a failed handler call into a CGI-style 500 response on the output stream.
// Result: the client sees the handler path, the OS error text, and the handler message.
//
// Anything the handler printed before failing is already in the stream, so in that case
// this block lands after body bytes and the response is malformed.
pub fn write_handler_failure(
    out: &mut dyn Write,
    phys: &Path,
    os_error: &io::Error,
    err: &HandlerError,
) -> io::Result<()> {
    out.write_all(FAILURE_HEADER.as_bytes())?;
    write!(
        out,
        "Unable to launch the requested Lua program:\n  {}: {}\n  {}\n",
        phys.display(),
        os_error,
        err.message
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_starts_with_status_block() {
        let mut out = Vec::new();
        let err = HandlerError::runtime("handler.lua:2: boom");
        let os_error = io::Error::from_raw_os_error(libc::ENOENT);
        write_handler_failure(&mut out, Path::new("/www/handler.lua"), &os_error, &err)
            .expect("write");

        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("Status: 500 Internal Server Error\r\n\r\n"));
        assert!(text.contains("/www/handler.lua"));
        assert!(text.contains("handler.lua:2: boom"));
        assert!(text.contains(&os_error.to_string()));
    }

    #[test]
    fn earlier_output_stays_ahead_of_failure() {
        let mut out = b"partial body".to_vec();
        let err = HandlerError::memory("not enough memory");
        let os_error = io::Error::from_raw_os_error(0);
        write_handler_failure(&mut out, Path::new("h.lua"), &os_error, &err).expect("write");
        assert!(out.starts_with(b"partial bodyStatus: 500"));
    }
}

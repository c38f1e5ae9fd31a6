use std::io::{self, Read};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Largest single read issued while collecting a body.
pub const RECV_CHUNK_SIZE: usize = 8192;

/// How long to wait for the input to become readable after a would-block read.
pub const READY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Length reported when the read failed before any byte arrived.
pub const RECV_FAILED: i64 = -1;

/// A byte stream with non-blocking semantics that can wait for readiness.
pub trait BodySource: Read {
    /// Returns `true` when input became readable within `timeout`.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
}

/// Result of one [`recv`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub data: Vec<u8>,
    pub length: i64,
}

impl Received {
    pub fn failed(&self) -> bool {
        self.length == RECV_FAILED
    }
}

/// Raw descriptor source; the isolated process reads its request body from stdin.
#[derive(Debug, Clone, Copy)]
pub struct FdSource {
    fd: RawFd,
}

impl FdSource {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn stdin() -> Self {
        Self::new(libc::STDIN_FILENO)
    }
}

impl Read for FdSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(read as usize)
    }
}

impl BodySource for FdSource {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pfd.revents & libc::POLLIN != 0)
    }
}

// Intent: collect up to max_len body bytes from a stream that may report would-block.
// Result: callers get the bytes and their count, or RECV_FAILED when nothing could be read.
pub fn recv<S: BodySource>(source: &mut S, max_len: i64) -> Received {
    let mut remaining = usize::try_from(max_len).unwrap_or(0);
    let mut data = Vec::new();
    let mut failed = false;
    let mut chunk = [0_u8; RECV_CHUNK_SIZE];

    while remaining > 0 {
        let want = remaining.min(RECV_CHUNK_SIZE);
        match source.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(read) => {
                data.extend_from_slice(&chunk[..read]);
                remaining -= read;
                // a short read ends the call even if more may arrive later
                if read < want {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match source.wait_readable(READY_TIMEOUT) {
                    Ok(true) => continue,
                    Ok(false) => tracing::debug!("request body not ready within timeout"),
                    Err(err) => tracing::debug!(error = %err, "waiting for request body failed"),
                }
                failed = data.is_empty();
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(error = %err, "reading request body failed");
                failed = data.is_empty();
                break;
            }
        }
    }

    let length = if failed { RECV_FAILED } else { data.len() as i64 };
    Received { data, length }
}

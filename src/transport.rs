//! Reply transport towards the controller.
//!
//! A reply is a short NUL-terminated text header, optionally followed by an
//! attachment of the length the header declares.

use std::fs::File;
use std::io::{self, Read, Write};

/// Sink for controller replies.
pub trait Transport {
    /// Send a header; the transport appends the terminating NUL.
    fn reply(&mut self, header: &str) -> io::Result<()>;

    /// Send an in-memory attachment.
    fn send_attachment(&mut self, data: &[u8]) -> io::Result<()>;

    /// Send up to `len` bytes from the current position of `file`.
    ///
    /// Returns how many bytes went out, which may be fewer than `len`.
    /// The file position advances by the same amount.
    fn send_file(&mut self, file: &File, len: u64) -> io::Result<u64>;
}

/// Transport over a connected stream socket.
pub struct SocketTransport<S> {
    stream: S,
}

impl<S> SocketTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(target_os = "linux")]
impl<S: Write + std::os::unix::io::AsRawFd> Transport for SocketTransport<S> {
    fn reply(&mut self, header: &str) -> io::Result<()> {
        write_header(&mut self.stream, header)
    }

    fn send_attachment(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn send_file(&mut self, file: &File, len: u64) -> io::Result<u64> {
        use std::os::unix::io::AsRawFd;

        self.stream.flush()?;
        let count = usize::try_from(len).unwrap_or(usize::MAX);
        // SAFETY: both descriptors are open for the duration of the call and
        // a null offset makes sendfile use and advance the file position.
        let sent = unsafe {
            libc::sendfile(
                self.stream.as_raw_fd(),
                file.as_raw_fd(),
                std::ptr::null_mut(),
                count,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as u64)
    }
}

#[cfg(not(target_os = "linux"))]
impl<S: Write> Transport for SocketTransport<S> {
    fn reply(&mut self, header: &str) -> io::Result<()> {
        write_header(&mut self.stream, header)
    }

    fn send_attachment(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn send_file(&mut self, file: &File, len: u64) -> io::Result<u64> {
        let sent = io::copy(&mut file.take(len), &mut self.stream)?;
        self.stream.flush()?;
        Ok(sent)
    }
}

fn write_header<W: Write>(w: &mut W, header: &str) -> io::Result<()> {
    w.write_all(header.as_bytes())?;
    w.write_all(&[0])?;
    w.flush()
}

/// Transport that collects everything in memory.
///
/// `short_writes` caps the byte count of successive `send_file` calls,
/// which lets callers exercise partial transmission.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub buffer: Vec<u8>,
    pub short_writes: Vec<u64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the next `send_file` calls at these byte counts.
    pub fn with_short_writes(mut self, counts: &[u64]) -> Self {
        self.short_writes = counts.to_vec();
        self
    }

    /// Split the buffer into its NUL-terminated header and the remainder.
    pub fn split_reply(&self) -> Option<(&str, &[u8])> {
        let end = self.buffer.iter().position(|&b| b == 0)?;
        let header = std::str::from_utf8(&self.buffer[..end]).ok()?;
        Some((header, &self.buffer[end + 1..]))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Transport for MemoryTransport {
    fn reply(&mut self, header: &str) -> io::Result<()> {
        write_header(&mut self.buffer, header)
    }

    fn send_attachment(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn send_file(&mut self, file: &File, len: u64) -> io::Result<u64> {
        let limit = if self.short_writes.is_empty() {
            len
        } else {
            self.short_writes.remove(0).min(len)
        };
        io::copy(&mut file.take(limit), &mut self.buffer)
    }
}

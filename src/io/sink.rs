//! Byte consumers fed by [`Source`](super::source::Source)s.
//!
//! The socket sink exposes the descriptor-level write used by the file
//! source's `sendfile` fast path; the buffer sink serves tests and filter
//! staging. Sources pattern-match the sink, so the fast path needs no
//! dynamic dispatch.

use crate::buffer::Buffer;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
#[cfg(target_os = "linux")]
use tokio::io::Interest;

pub enum Sink<'a> {
    Socket(SocketSink<'a>),
    Buffer(&'a mut Buffer),
}

impl<'a> Sink<'a> {
    pub fn socket(stream: &'a mut TcpStream) -> Sink<'a> {
        Sink::Socket(SocketSink { stream })
    }

    pub fn buffer(buf: &'a mut Buffer) -> Sink<'a> {
        Sink::Buffer(buf)
    }

    /// Writes as much of `data` as the sink accepts right now.
    pub(crate) async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Socket(sock) => sock.write(data).await,
            Sink::Buffer(buf) => {
                buf.append(data);
                Ok(data.len())
            }
        }
    }
}

/// Non-blocking socket consumer.
pub struct SocketSink<'a> {
    stream: &'a mut TcpStream,
}

impl SocketSink<'_> {
    pub(crate) async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data).await
    }

    /// Descriptor-level write: moves up to `count` bytes from `file` at
    /// `*offset` straight to the socket, advancing the offset by the bytes
    /// sent. Kernel copy on Linux, read-then-write elsewhere.
    #[cfg(target_os = "linux")]
    pub(crate) async fn write_file(
        &mut self,
        file: &std::fs::File,
        offset: &mut u64,
        count: usize,
    ) -> io::Result<usize> {
        loop {
            self.stream.writable().await?;

            let result = self.stream.try_io(Interest::WRITABLE, || {
                let mut off = *offset as libc::off_t;
                match nix::sys::sendfile::sendfile(
                    self.stream.as_raw_fd(),
                    file.as_raw_fd(),
                    Some(&mut off),
                    count,
                ) {
                    Ok(sent) => {
                        *offset = off as u64;
                        Ok(sent)
                    }
                    Err(nix::errno::Errno::EAGAIN) => {
                        Err(io::Error::from(io::ErrorKind::WouldBlock))
                    }
                    Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
                }
            });

            match result {
                Ok(sent) => return Ok(sent),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) async fn write_file(
        &mut self,
        file: &std::fs::File,
        offset: &mut u64,
        count: usize,
    ) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut chunk = vec![0u8; count.min(64 * 1024)];
        let read = file.read_at(&mut chunk, *offset)?;
        if read == 0 {
            return Ok(0);
        }
        let written = self.stream.write(&chunk[..read]).await?;
        *offset += written as u64;
        Ok(written)
    }

    /// `TCP_CORK`: batches header and body segments into full frames.
    /// No-op on platforms without cork.
    pub(crate) fn set_cork(&self, enabled: bool) {
        #[cfg(target_os = "linux")]
        {
            let value: libc::c_int = enabled as libc::c_int;
            unsafe {
                libc::setsockopt(
                    self.stream.as_raw_fd(),
                    libc::IPPROTO_TCP,
                    libc::TCP_CORK,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = enabled;
    }
}

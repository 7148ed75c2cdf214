//! Byte producers drained into a [`Sink`] via `sendto`.
//!
//! A closed sum of source kinds; the composite source is the connection's
//! output queue. `sendto` writes as much as possible without blocking the
//! thread and returns the bytes moved; `Ok(0)` means the source is
//! exhausted. The caller re-invokes on the next writable event.

use crate::buffer::Buffer;
use crate::io::filter::FilterChain;
use crate::io::sink::Sink;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;

pub enum Source {
    Buffer(BufferSource),
    File(FileSource),
    Callback(CallbackSource),
    Filter(FilterSource),
    Composite(CompositeSource),
}

impl Source {
    pub async fn sendto(&mut self, sink: &mut Sink<'_>) -> io::Result<usize> {
        match self {
            Source::Buffer(src) => src.sendto(sink).await,
            Source::File(src) => src.sendto(sink).await,
            Source::Callback(src) => Ok(src.fire()),
            Source::Filter(src) => src.sendto(sink).await,
            Source::Composite(src) => src.sendto(sink).await,
        }
    }

    /// Boxed indirection so composite and filter sources can recurse.
    fn sendto_dyn<'a>(
        &'a mut self,
        sink: &'a mut Sink<'_>,
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + 'a>> {
        Box::pin(self.sendto(sink))
    }
}

impl From<Vec<u8>> for Source {
    fn from(data: Vec<u8>) -> Self {
        Source::Buffer(BufferSource::new(data))
    }
}

impl From<&[u8]> for Source {
    fn from(data: &[u8]) -> Self {
        Source::Buffer(BufferSource::new(data.to_vec()))
    }
}

/// Owned bytes with a read cursor.
pub struct BufferSource {
    data: Vec<u8>,
    pos: usize,
}

impl BufferSource {
    pub fn new(data: Vec<u8>) -> Self {
        BufferSource { data, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    async fn sendto(&mut self, sink: &mut Sink<'_>) -> io::Result<usize> {
        if self.pos == self.data.len() {
            return Ok(0);
        }
        let sent = sink.write(&self.data[self.pos..]).await?;
        self.pos += sent;
        Ok(sent)
    }
}

impl From<Buffer> for BufferSource {
    fn from(buf: Buffer) -> Self {
        BufferSource::new(buf.into_vec())
    }
}

/// An open file region. Takes the kernel `sendfile` path when draining
/// into a socket sink.
pub struct FileSource {
    file: std::fs::File,
    offset: u64,
    remaining: u64,
}

impl FileSource {
    pub fn new(file: std::fs::File, offset: u64, count: u64) -> Self {
        FileSource {
            file,
            offset,
            remaining: count,
        }
    }

    async fn sendto(&mut self, sink: &mut Sink<'_>) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let quantum = self.remaining.min(1 << 20) as usize;

        let sent = match sink {
            Sink::Socket(sock) => {
                sock.write_file(&self.file, &mut self.offset, quantum).await?
            }
            Sink::Buffer(buf) => {
                use std::os::unix::fs::FileExt;
                let mut chunk = vec![0u8; quantum.min(64 * 1024)];
                let read = self.file.read_at(&mut chunk, self.offset)?;
                buf.append(&chunk[..read]);
                self.offset += read as u64;
                read
            }
        };

        if sent == 0 {
            // File shorter than announced; report EOF rather than spin.
            self.remaining = 0;
        } else {
            self.remaining -= sent as u64;
        }
        Ok(sent)
    }
}

/// Invokes a callback exactly once on first `sendto`, then reports empty.
/// Enqueued behind pending output, this is the write-completion hook.
pub struct CallbackSource {
    callback: Option<Box<dyn FnOnce()>>,
}

impl CallbackSource {
    pub fn new(callback: Box<dyn FnOnce()>) -> Self {
        CallbackSource {
            callback: Some(callback),
        }
    }

    fn fire(&mut self) -> usize {
        if let Some(callback) = self.callback.take() {
            callback();
        }
        0
    }
}

/// Wraps another source and transforms its bytes through a shared
/// [`FilterChain`]. With `last`, the chain's tail bytes are flushed once
/// the inner source is exhausted.
pub struct FilterSource {
    inner: Box<Source>,
    chain: Rc<RefCell<FilterChain>>,
    last: bool,
    staged: Vec<u8>,
    staged_pos: usize,
    inner_done: bool,
    flushed: bool,
}

impl FilterSource {
    pub fn new(inner: Source, chain: Rc<RefCell<FilterChain>>, last: bool) -> Self {
        FilterSource {
            inner: Box::new(inner),
            chain,
            last,
            staged: Vec::new(),
            staged_pos: 0,
            inner_done: false,
            flushed: false,
        }
    }

    async fn sendto(&mut self, sink: &mut Sink<'_>) -> io::Result<usize> {
        while self.staged_pos == self.staged.len() {
            if self.inner_done {
                if self.last && !self.flushed {
                    self.flushed = true;
                    self.staged = self.chain.borrow_mut().apply(&[], true)?;
                    self.staged_pos = 0;
                    continue;
                }
                return Ok(0);
            }

            let mut staging = Buffer::new();
            let pulled = {
                let mut stage_sink = Sink::buffer(&mut staging);
                self.inner.sendto_dyn(&mut stage_sink).await?
            };

            if pulled == 0 {
                self.inner_done = true;
            } else {
                self.staged = self
                    .chain
                    .borrow_mut()
                    .apply(staging.as_slice(), false)?;
                self.staged_pos = 0;
            }
        }

        let sent = sink.write(&self.staged[self.staged_pos..]).await?;
        self.staged_pos += sent;
        Ok(sent)
    }
}

/// Ordered queue of sources, drained head-to-tail. Never reorders.
#[derive(Default)]
pub struct CompositeSource {
    queue: VecDeque<Source>,
}

impl CompositeSource {
    pub fn new() -> Self {
        CompositeSource {
            queue: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, source: Source) {
        self.queue.push_back(source);
    }

    pub fn pop_front(&mut self) -> Option<Source> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    async fn sendto(&mut self, sink: &mut Sink<'_>) -> io::Result<usize> {
        while let Some(front) = self.queue.front_mut() {
            let sent = front.sendto_dyn(sink).await?;
            if sent == 0 {
                self.queue.pop_front();
                continue;
            }
            return Ok(sent);
        }
        Ok(0)
    }
}

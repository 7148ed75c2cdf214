//! Growable byte arena and non-owning sub-slices.
//!
//! A [`Buffer`] owns its bytes; a [`ByteRef`] is a `(buffer, offset, length)`
//! triple resolved against the buffer on every access, so refs stay valid
//! across the owner's moves and reallocations. Refs into a buffer region
//! that has been truncated away resolve to the empty slice.

use memchr::memchr;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

/// Shared handle to a [`Buffer`], cloned into every [`ByteRef`] cut from it.
pub type SharedBuffer = Rc<RefCell<Buffer>>;

/// An owning, growable byte vector.
#[derive(Debug, Default, PartialEq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    #[inline]
    pub fn new() -> Self {
        Buffer { data: Vec::new() }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn shared(self) -> SharedBuffer {
        Rc::new(RefCell::new(self))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Removes the first `count` bytes, shifting the rest to the front.
    /// Outstanding refs keep their offsets and therefore shift with the data;
    /// callers compact only when no refs into the region remain.
    pub fn consume(&mut self, count: usize) {
        self.data.drain(..count.min(self.data.len()));
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer { data }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Buffer {
            data: data.to_vec(),
        }
    }
}

/// A logical slice of some [`Buffer`].
///
/// Offsets are recomputed on every access, never cached as pointers. A ref
/// whose range has been truncated away yields the empty slice.
#[derive(Clone)]
pub struct ByteRef {
    buf: SharedBuffer,
    offset: usize,
    len: usize,
}

impl ByteRef {
    #[inline]
    pub fn new(buf: SharedBuffer, offset: usize, len: usize) -> Self {
        ByteRef { buf, offset, len }
    }

    /// An empty ref bound to a fresh empty buffer.
    pub fn empty() -> Self {
        ByteRef {
            buf: Buffer::new().shared(),
            offset: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Resolves the ref against its buffer. The guard borrows the buffer for
    /// as long as the returned slice lives.
    pub fn bytes(&self) -> Ref<'_, [u8]> {
        Ref::map(self.buf.borrow(), |b| {
            let data = b.as_slice();
            let start = self.offset.min(data.len());
            let end = (self.offset + self.len).min(data.len());
            &data[start..end]
        })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// Lossy UTF-8 copy, for logging and CGI environment values.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    /// Position of `byte` within the ref.
    pub fn find(&self, byte: u8) -> Option<usize> {
        memchr(byte, &self.bytes())
    }

    /// Position of `needle` within the ref.
    pub fn find_sub(&self, needle: &[u8]) -> Option<usize> {
        let bytes = self.bytes();
        if needle.is_empty() || needle.len() > bytes.len() {
            return None;
        }
        bytes.windows(needle.len()).position(|w| w == needle)
    }

    /// Sub-slice relative to this ref; clamped to its bounds.
    pub fn slice(&self, from: usize, len: usize) -> ByteRef {
        let from = from.min(self.len);
        ByteRef {
            buf: self.buf.clone(),
            offset: self.offset + from,
            len: len.min(self.len - from),
        }
    }

    pub fn eq_ignore_case(&self, other: &[u8]) -> bool {
        self.bytes().eq_ignore_ascii_case(other)
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.bytes().starts_with(prefix)
    }

    /// Parses the ref as an unsigned decimal integer.
    pub fn to_usize(&self) -> Option<usize> {
        let bytes = self.bytes();
        if bytes.is_empty() {
            return None;
        }
        let mut result: usize = 0;
        for &byte in bytes.iter() {
            if !byte.is_ascii_digit() {
                return None;
            }
            result = result
                .checked_mul(10)?
                .checked_add((byte - b'0') as usize)?;
        }
        Some(result)
    }
}

impl PartialEq for ByteRef {
    fn eq(&self, other: &Self) -> bool {
        *self.bytes() == *other.bytes()
    }
}

impl PartialEq<[u8]> for ByteRef {
    fn eq(&self, other: &[u8]) -> bool {
        *self.bytes() == *other
    }
}

impl PartialEq<&[u8]> for ByteRef {
    fn eq(&self, other: &&[u8]) -> bool {
        *self.bytes() == **other
    }
}

impl fmt::Debug for ByteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteRef({:?})", String::from_utf8_lossy(&self.bytes()))
    }
}

#[cfg(test)]
mod buffer_tests {
    use super::*;

    #[test]
    fn append_and_slice() {
        let mut buf = Buffer::new();
        buf.append(b"GET /index.html");

        assert_eq!(buf.len(), 15);
        assert_eq!(&buf.as_slice()[..3], b"GET");

        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn consume_shifts_front() {
        let mut buf = Buffer::from(b"abcdef" as &[u8]);
        buf.consume(2);
        assert_eq!(buf.as_slice(), b"cdef");
        buf.consume(100);
        assert!(buf.is_empty());
    }
}

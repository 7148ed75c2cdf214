//! Outgoing byte transforms.
//!
//! A [`FilterChain`] is an ordered list of stages; each stage maps an input
//! slice to a fresh output buffer and may hold compression state across
//! calls. `apply(.., last = true)` flushes the tail bytes of every stateful
//! stage. Chunked transfer-encoding is itself a stage, appended by the
//! response serializer when chunked framing is chosen.

use bzip2::write::BzEncoder;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{self, Write};
use std::mem;

pub enum Filter {
    /// `deflate` content-coding (zlib framing).
    Deflate(ZlibEncoder<Vec<u8>>),
    /// `gzip` content-coding.
    Gzip(GzEncoder<Vec<u8>>),
    /// `bzip2` content-coding.
    Bzip2(BzEncoder<Vec<u8>>),
    /// `chunked` transfer-coding.
    Chunked { finished: bool },
}

impl Filter {
    pub fn deflate(level: u32) -> Filter {
        Filter::Deflate(ZlibEncoder::new(Vec::new(), Compression::new(level)))
    }

    pub fn gzip(level: u32) -> Filter {
        Filter::Gzip(GzEncoder::new(Vec::new(), Compression::new(level)))
    }

    pub fn bzip2(level: u32) -> Filter {
        Filter::Bzip2(BzEncoder::new(Vec::new(), bzip2::Compression::new(level)))
    }

    pub(crate) fn chunked() -> Filter {
        Filter::Chunked { finished: false }
    }

    /// Transforms one input chunk. The output may be empty while a
    /// compressor accumulates state.
    pub fn process(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Filter::Deflate(enc) => {
                enc.write_all(data)?;
                enc.flush()?;
                Ok(mem::take(enc.get_mut()))
            }
            Filter::Gzip(enc) => {
                enc.write_all(data)?;
                enc.flush()?;
                Ok(mem::take(enc.get_mut()))
            }
            Filter::Bzip2(enc) => {
                enc.write_all(data)?;
                enc.flush()?;
                Ok(mem::take(enc.get_mut()))
            }
            Filter::Chunked { .. } => {
                if data.is_empty() {
                    return Ok(Vec::new());
                }
                let mut out = format!("{:X}\r\n", data.len()).into_bytes();
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
                Ok(out)
            }
        }
    }

    /// Emits the stage's trailing bytes. Called exactly once, at the end of
    /// the stream.
    pub fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Filter::Deflate(enc) => mem::replace(enc, ZlibEncoder::new(Vec::new(), Compression::none())).finish(),
            Filter::Gzip(enc) => mem::replace(enc, GzEncoder::new(Vec::new(), Compression::none())).finish(),
            Filter::Bzip2(enc) => mem::replace(enc, BzEncoder::new(Vec::new(), bzip2::Compression::new(1))).finish(),
            Filter::Chunked { finished } => {
                if *finished {
                    return Ok(Vec::new());
                }
                *finished = true;
                Ok(b"0\r\n\r\n".to_vec())
            }
        }
    }
}

/// Ordered list of [`Filter`] stages applied to outgoing bytes.
#[derive(Default)]
pub struct FilterChain {
    stages: Vec<Filter>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain { stages: Vec::new() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn push(&mut self, filter: Filter) {
        self.stages.push(filter);
    }

    /// Runs `data` through every stage in order. With `last`, each stage's
    /// tail bytes are flushed behind its transformed output before feeding
    /// the next stage.
    pub fn apply(&mut self, data: &[u8], last: bool) -> io::Result<Vec<u8>> {
        let mut current: Option<Vec<u8>> = None;

        for stage in &mut self.stages {
            let input = current.as_deref().unwrap_or(data);
            let mut out = stage.process(input)?;
            if last {
                out.extend_from_slice(&stage.finish()?);
            }
            current = Some(out);
        }

        Ok(current.unwrap_or_else(|| data.to_vec()))
    }
}

#[cfg(test)]
mod chunked_tests {
    use super::*;

    #[test]
    fn frames_each_chunk() {
        let mut f = Filter::chunked();

        assert_eq!(f.process(b"hello").unwrap(), b"5\r\nhello\r\n");
        assert_eq!(f.process(b"").unwrap(), b"");

        let tail = vec![b'x'; 255];
        let framed = f.process(&tail).unwrap();
        assert!(framed.starts_with(b"FF\r\n"));
        assert!(framed.ends_with(b"\r\n"));

        assert_eq!(f.finish().unwrap(), b"0\r\n\r\n");
        assert_eq!(f.finish().unwrap(), b"");
    }
}


#[cfg(test)]
mod chain_tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn empty_chain_is_identity() {
        let mut chain = FilterChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.apply(b"payload", false).unwrap(), b"payload");
    }

    #[test]
    fn gzip_then_chunked() {
        let mut chain = FilterChain::new();
        chain.push(Filter::gzip(6));
        chain.push(Filter::chunked());
        assert_eq!(chain.len(), 2);

        let mut wire = Vec::new();
        wire.extend_from_slice(&chain.apply(b"first ", false).unwrap());
        wire.extend_from_slice(&chain.apply(b"second", true).unwrap());

        // Strip the chunked framing, then gunzip.
        let mut gz = Vec::new();
        let mut rest = &wire[..];
        loop {
            let line_end = rest.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(
                std::str::from_utf8(&rest[..line_end]).unwrap(),
                16,
            )
            .unwrap();
            rest = &rest[line_end + 2..];
            if size == 0 {
                break;
            }
            gz.extend_from_slice(&rest[..size]);
            rest = &rest[size + 2..];
        }

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&gz[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, b"first second");
    }
}

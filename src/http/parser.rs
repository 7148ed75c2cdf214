//! Incremental HTTP message parser.
//!
//! A character-class driven state machine over request line, headers, and
//! body. Two modes: `Request` parses full requests from connection input;
//! `Message` parses a FastCGI backend's CGI response (headers and body,
//! no request line).
//!
//! The parser is fed the unconsumed region of a stream buffer and returns
//! how many bytes it consumed; the remainder is re-fed on the next call.
//! Consumption only ever advances at complete syntactic elements (a line,
//! a run of body bytes), so feeding a valid stream in any chunking yields
//! the same event sequence and the same consumed total. Events carry both
//! a borrowed slice and the absolute span within the stream buffer, so
//! callers can stay zero-copy.
//!
//! Returning `false` from any event pauses the parser immediately; the
//! processor decides when to resume feeding.

use crate::http::types::{is_ctl, is_token};
use memchr::memchr;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ParseMode {
    /// Request line, headers, body.
    Request,
    /// Headers and body only (FastCGI stdout).
    Message,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ParseError {
    /// Malformed request line, header, or body framing. Answered with 400.
    BadMessage,
    /// Header size or count cap exceeded. Answered with 413.
    HeaderLimit,
}

/// Receiver for parser events. Spans are absolute offsets into the stream
/// buffer the parser was fed from.
pub(crate) trait MessageHandler {
    fn on_message_begin(
        &mut self,
        _method: &[u8],
        _method_span: Range<usize>,
        _uri: &[u8],
        _uri_span: Range<usize>,
        _version: (u8, u8),
    ) -> bool {
        true
    }

    fn on_message_header(
        &mut self,
        name: &[u8],
        name_span: Range<usize>,
        value: &[u8],
        value_span: Range<usize>,
    ) -> bool;

    fn on_message_header_end(&mut self) -> bool {
        true
    }

    fn on_message_content(&mut self, chunk: &[u8], chunk_span: Range<usize>) -> bool;

    fn on_message_end(&mut self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    MessageBegin,
    HeaderLine,
    /// Blank line consumed, `on_message_header_end` still owed (a header
    /// flush paused the parser in between).
    HeaderEnd,
    BodyIdentity { remaining: u64 },
    /// Message-mode body without a length: content until stream end.
    BodyEof,
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailer,
    /// Body done, `on_message_end` still owed.
    EndPending,
    MessageEnd,
}

/// Longest tolerated chunk-size line, generous for extensions.
const MAX_CHUNK_HEAD: usize = 128;

pub(crate) struct MessageParser {
    mode: ParseMode,
    state: State,
    max_header_size: usize,
    max_header_count: usize,
    max_request_line: usize,
    header_count: usize,
    content_length: Option<u64>,
    chunked: bool,
    /// Completed header waiting for a possible LWS continuation line.
    pending: Option<(Range<usize>, Range<usize>)>,
}

impl MessageParser {
    pub(crate) fn new(
        mode: ParseMode,
        max_header_size: usize,
        max_header_count: usize,
        max_request_line: usize,
    ) -> Self {
        MessageParser {
            mode,
            state: State::MessageBegin,
            max_header_size,
            max_header_count,
            max_request_line,
            header_count: 0,
            content_length: None,
            chunked: false,
            pending: None,
        }
    }

    /// Back to `MessageBegin` for the next message on the same stream.
    pub(crate) fn reset(&mut self) {
        self.state = State::MessageBegin;
        self.header_count = 0;
        self.content_length = None;
        self.chunked = false;
        self.pending = None;
    }

    pub(crate) fn message_complete(&self) -> bool {
        self.state == State::MessageEnd
    }

    pub(crate) fn headers_done(&self) -> bool {
        !matches!(
            self.state,
            State::MessageBegin | State::HeaderLine | State::HeaderEnd
        )
    }

    /// Feeds the unconsumed region `buf[from..]`; returns bytes consumed.
    pub(crate) fn parse(
        &mut self,
        buf: &mut [u8],
        from: usize,
        handler: &mut dyn MessageHandler,
    ) -> Result<usize, ParseError> {
        let mut pos = from;

        loop {
            match self.state {
                State::MessageEnd => return Ok(pos - from),

                State::MessageBegin => {
                    if self.mode == ParseMode::Message {
                        self.state = State::HeaderLine;
                        continue;
                    }
                    let Some(line_end) = self.find_line(buf, pos, self.max_request_line)? else {
                        return Ok(pos - from);
                    };
                    let cont = self.parse_request_line(buf, pos..line_end, handler)?;
                    pos = line_end + 2;
                    self.state = State::HeaderLine;
                    if !cont {
                        return Ok(pos - from);
                    }
                }

                State::HeaderLine => {
                    let Some(line_end) = self.find_line(buf, pos, self.max_header_size)? else {
                        return Ok(pos - from);
                    };
                    let line = pos..line_end;
                    pos = line_end + 2;

                    if line.is_empty() {
                        self.state = State::HeaderEnd;
                        if !self.flush_pending(buf, handler)? {
                            return Ok(pos - from);
                        }
                        continue;
                    }

                    if buf[line.start] == b' ' || buf[line.start] == b'\t' {
                        self.fold_continuation(buf, line)?;
                        continue;
                    }

                    let cont = self.flush_pending(buf, handler)?;
                    self.stash_header(buf, line)?;
                    if !cont {
                        return Ok(pos - from);
                    }
                }

                State::HeaderEnd => {
                    self.state = self.body_state();
                    if !handler.on_message_header_end() {
                        return Ok(pos - from);
                    }
                }

                State::BodyIdentity { remaining } => {
                    let avail = (buf.len() - pos).min(remaining as usize);
                    if avail == 0 {
                        return Ok(pos - from);
                    }
                    let span = pos..pos + avail;
                    let cont = handler.on_message_content(&buf[span.clone()], span);
                    pos += avail;
                    let remaining = remaining - avail as u64;
                    self.state = if remaining == 0 {
                        State::EndPending
                    } else {
                        State::BodyIdentity { remaining }
                    };
                    if !cont {
                        return Ok(pos - from);
                    }
                }

                State::BodyEof => {
                    let avail = buf.len() - pos;
                    if avail == 0 {
                        return Ok(pos - from);
                    }
                    let span = pos..pos + avail;
                    let cont = handler.on_message_content(&buf[span.clone()], span);
                    pos += avail;
                    if !cont {
                        return Ok(pos - from);
                    }
                }

                State::ChunkSize => {
                    let Some(line_end) = self.find_line(buf, pos, MAX_CHUNK_HEAD)? else {
                        return Ok(pos - from);
                    };
                    let size = parse_chunk_size(&buf[pos..line_end])?;
                    pos = line_end + 2;
                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }

                State::ChunkData { remaining } => {
                    let avail = (buf.len() - pos).min(remaining as usize);
                    if avail == 0 {
                        return Ok(pos - from);
                    }
                    let span = pos..pos + avail;
                    let cont = handler.on_message_content(&buf[span.clone()], span);
                    pos += avail;
                    let remaining = remaining - avail as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                    if !cont {
                        return Ok(pos - from);
                    }
                }

                State::ChunkDataEnd => {
                    if buf.len() - pos < 2 {
                        return Ok(pos - from);
                    }
                    if &buf[pos..pos + 2] != b"\r\n" {
                        return Err(ParseError::BadMessage);
                    }
                    pos += 2;
                    self.state = State::ChunkSize;
                }

                State::Trailer => {
                    let Some(line_end) = self.find_line(buf, pos, self.max_header_size)? else {
                        return Ok(pos - from);
                    };
                    let empty = line_end == pos;
                    pos = line_end + 2;
                    if empty {
                        self.state = State::EndPending;
                    }
                }

                State::EndPending => {
                    self.state = State::MessageEnd;
                    handler.on_message_end();
                    return Ok(pos - from);
                }
            }
        }
    }

    /// Finds the next complete CRLF-terminated line starting at `pos`;
    /// returns the index of the `\r`. `None` means the line is incomplete,
    /// after checking it has not already outgrown `cap`.
    fn find_line(&self, buf: &[u8], pos: usize, cap: usize) -> Result<Option<usize>, ParseError> {
        match memchr(b'\n', &buf[pos..]) {
            Some(nl) => {
                if nl == 0 || buf[pos + nl - 1] != b'\r' {
                    return Err(ParseError::BadMessage);
                }
                if nl - 1 > cap {
                    return Err(self.cap_error());
                }
                Ok(Some(pos + nl - 1))
            }
            None => {
                if buf.len() - pos > cap + 2 {
                    return Err(self.cap_error());
                }
                Ok(None)
            }
        }
    }

    fn cap_error(&self) -> ParseError {
        match self.state {
            State::MessageBegin | State::ChunkSize => ParseError::BadMessage,
            _ => ParseError::HeaderLimit,
        }
    }

    fn parse_request_line(
        &mut self,
        buf: &[u8],
        line: Range<usize>,
        handler: &mut dyn MessageHandler,
    ) -> Result<bool, ParseError> {
        let bytes = &buf[line.clone()];

        let method_len = bytes.iter().take_while(|&&b| is_token(b)).count();
        if method_len == 0 || bytes.get(method_len) != Some(&b' ') {
            return Err(ParseError::BadMessage);
        }

        let uri_start = method_len + 1;
        let uri_len = bytes[uri_start..]
            .iter()
            .take_while(|&&b| b != b' ' && !is_ctl(b))
            .count();
        if uri_len == 0 || bytes.get(uri_start + uri_len) != Some(&b' ') {
            return Err(ParseError::BadMessage);
        }

        let version = &bytes[uri_start + uri_len + 1..];
        let Some(digits) = version.strip_prefix(b"HTTP/") else {
            return Err(ParseError::BadMessage);
        };
        let dot = memchr(b'.', digits).ok_or(ParseError::BadMessage)?;
        let major = parse_version_part(&digits[..dot])?;
        let minor = parse_version_part(&digits[dot + 1..])?;

        let method_span = line.start..line.start + method_len;
        let uri_span = line.start + uri_start..line.start + uri_start + uri_len;
        Ok(handler.on_message_begin(
            &buf[method_span.clone()],
            method_span,
            &buf[uri_span.clone()],
            uri_span,
            (major, minor),
        ))
    }

    /// Validates a header line and parks it, pending possible continuation.
    fn stash_header(&mut self, buf: &mut [u8], line: Range<usize>) -> Result<(), ParseError> {
        let bytes = &buf[line.clone()];

        let name_len = bytes.iter().take_while(|&&b| is_token(b)).count();
        if name_len == 0 || bytes.get(name_len) != Some(&b':') {
            return Err(ParseError::BadMessage);
        }

        let mut value_start = name_len + 1;
        while bytes.get(value_start) == Some(&b' ') || bytes.get(value_start) == Some(&b'\t') {
            value_start += 1;
        }
        for &b in &bytes[value_start..] {
            if is_ctl(b) && b != b'\t' {
                return Err(ParseError::BadMessage);
            }
        }

        self.pending = Some((
            line.start..line.start + name_len,
            line.start + value_start..line.end,
        ));
        Ok(())
    }

    /// Merges an LWS continuation line into the pending header, rewriting
    /// the fold bytes (CRLF and leading whitespace) to spaces so the value
    /// stays one contiguous span.
    fn fold_continuation(&mut self, buf: &mut [u8], line: Range<usize>) -> Result<(), ParseError> {
        let Some((_, value)) = self.pending.as_mut() else {
            return Err(ParseError::BadMessage);
        };

        let mut content_start = line.start;
        while content_start < line.end
            && (buf[content_start] == b' ' || buf[content_start] == b'\t')
        {
            content_start += 1;
        }
        for &b in &buf[content_start..line.end] {
            if is_ctl(b) && b != b'\t' {
                return Err(ParseError::BadMessage);
            }
        }
        if line.end - value.start > self.max_header_size {
            return Err(ParseError::HeaderLimit);
        }

        if content_start < line.end {
            for byte in &mut buf[value.end..content_start] {
                *byte = b' ';
            }
            value.end = line.end;
        }
        Ok(())
    }

    /// Emits the parked header, intercepting the framing headers.
    fn flush_pending(
        &mut self,
        buf: &[u8],
        handler: &mut dyn MessageHandler,
    ) -> Result<bool, ParseError> {
        let Some((name, value)) = self.pending.take() else {
            return Ok(true);
        };

        self.header_count += 1;
        if self.header_count > self.max_header_count {
            return Err(ParseError::HeaderLimit);
        }

        let name_bytes = &buf[name.clone()];
        let value_bytes = &buf[value.clone()];

        if name_bytes.eq_ignore_ascii_case(b"Content-Length") {
            let parsed = parse_content_length(value_bytes)?;
            if self.content_length.replace(parsed).is_some_and(|old| old != parsed) {
                return Err(ParseError::BadMessage);
            }
        } else if name_bytes.eq_ignore_ascii_case(b"Transfer-Encoding")
            && value_bytes.eq_ignore_ascii_case(b"chunked")
        {
            self.chunked = true;
        }

        Ok(handler.on_message_header(name_bytes, name, value_bytes, value))
    }

    fn body_state(&self) -> State {
        if self.chunked {
            return State::ChunkSize;
        }
        match self.content_length {
            Some(0) | None if self.mode == ParseMode::Request => State::EndPending,
            Some(0) => State::EndPending,
            Some(n) => State::BodyIdentity { remaining: n },
            None => State::BodyEof,
        }
    }

    /// Whether the current message carries a body.
    pub(crate) fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some_and(|n| n > 0)
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.chunked
    }
}

fn parse_version_part(digits: &[u8]) -> Result<u8, ParseError> {
    if digits.is_empty() || digits.len() > 2 {
        return Err(ParseError::BadMessage);
    }
    let mut value: u8 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ParseError::BadMessage);
        }
        value = value * 10 + (b - b'0');
    }
    Ok(value)
}

fn parse_content_length(value: &[u8]) -> Result<u64, ParseError> {
    if value.is_empty() {
        return Err(ParseError::BadMessage);
    }
    let mut parsed: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(ParseError::BadMessage);
        }
        parsed = parsed
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or(ParseError::BadMessage)?;
    }
    Ok(parsed)
}

/// Hex chunk size, tolerating `;extension` tails.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits_end = line
        .iter()
        .position(|&b| b == b';')
        .unwrap_or(line.len());
    let digits = &line[..digits_end];
    if digits.is_empty() {
        return Err(ParseError::BadMessage);
    }
    let mut size: u64 = 0;
    for &b in digits {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::BadMessage),
        };
        size = size
            .checked_mul(16)
            .and_then(|v| v.checked_add(nibble as u64))
            .ok_or(ParseError::BadMessage)?;
    }
    Ok(size)
}

//! Response header serialization and default error pages.

use crate::http::request::HttpRequest;
use crate::http::types::reason_phrase;
use crate::io::filter::Filter;
use std::cell::{Cell, RefCell};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const SERVER_SOFTWARE: &str = concat!("origin_web/", env!("CARGO_PKG_VERSION"));

/// Body framing chosen while serializing the response headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Framing {
    /// `Content-Length` provided by the handler.
    Identity,
    /// `Transfer-Encoding: chunked`; a chunked encoder stage has been
    /// appended to the request's filter chain.
    Chunked,
    /// HTTP/1.0 peer without a length: stream until close.
    CloseDelimited,
    /// HEAD or a 1xx/204/304 status: no body bytes permitted.
    Forbidden,
}

/// Serializes the status line and response headers, guaranteeing `Date`,
/// `Server`, `Connection`, and body framing headers are present.
pub(crate) fn serialize(req: &mut HttpRequest, keep_alive: bool, date: &str) -> (Vec<u8>, Framing) {
    let status = req.status.unwrap_or(200);
    let reason = reason_phrase(status);

    let framing = if req.is_response_content_forbidden() {
        Framing::Forbidden
    } else if req.response_headers.contains("Content-Length") {
        Framing::Identity
    } else if req.version == (1, 0) {
        Framing::CloseDelimited
    } else {
        Framing::Chunked
    };

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.to_string().as_bytes());
    if !reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");

    if !req.response_headers.contains("Date") {
        push_header(&mut out, "Date", date);
    }
    if !req.response_headers.contains("Server") {
        push_header(&mut out, "Server", SERVER_SOFTWARE);
    }
    if !req.response_headers.contains("Connection") {
        let value = if keep_alive && framing != Framing::CloseDelimited {
            "keep-alive"
        } else {
            "close"
        };
        push_header(&mut out, "Connection", value);
    }
    if framing == Framing::Chunked {
        push_header(&mut out, "Transfer-Encoding", "chunked");
        req.output_filters.borrow_mut().push(Filter::chunked());
    }

    for (name, value) in req.response_headers.iter() {
        push_header(&mut out, name, value);
    }
    out.extend_from_slice(b"\r\n");

    req.chunked_response = framing == Framing::Chunked;
    (out, framing)
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Minimal HTML page for a request finished without content.
pub(crate) fn default_error_page(status: u16) -> Vec<u8> {
    let reason = reason_phrase(status);
    format!(
        "<html><head><title>{status} {reason}</title></head>\
         <body><h1>{status} {reason}</h1></body></html>\n"
    )
    .into_bytes()
}

/// Per-worker `Date` header cache at one-second granularity.
pub(crate) struct DateCache {
    second: Cell<u64>,
    value: RefCell<String>,
}

impl DateCache {
    pub(crate) fn new() -> Self {
        DateCache {
            second: Cell::new(u64::MAX),
            value: RefCell::new(String::new()),
        }
    }

    pub(crate) fn http_date(&self) -> String {
        let now = SystemTime::now();
        let second = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if self.second.get() != second {
            self.second.set(second);
            *self.value.borrow_mut() = httpdate::fmt_http_date(now);
        }
        self.value.borrow().clone()
    }
}

#[cfg(test)]
mod serialize_tests {
    use super::*;
    use crate::tools::*;

    const DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

    fn output(req: &mut HttpRequest, keep_alive: bool) -> (String, Framing) {
        let (bytes, framing) = serialize(req, keep_alive, DATE);
        (str_op(&bytes).to_owned(), framing)
    }

    #[test]
    fn fills_required_headers() {
        let mut req = HttpRequest::new();
        req.status = Some(200);
        req.response_headers.append("Content-Length", "6");

        let (head, framing) = output(&mut req, true);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains(&format!("Date: {DATE}\r\n")));
        assert!(head.contains(&format!("Server: {SERVER_SOFTWARE}\r\n")));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Content-Length: 6\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(framing, Framing::Identity);
    }

    #[test]
    fn chunked_when_no_length() {
        let mut req = HttpRequest::new();
        req.status = Some(200);

        let (head, framing) = output(&mut req, true);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(framing, Framing::Chunked);
        assert!(req.chunked_response);
        assert_eq!(req.output_filters.borrow().len(), 1);
    }

    #[test]
    fn http10_without_length_closes() {
        let mut req = HttpRequest::new();
        req.version = (1, 0);
        req.status = Some(200);

        let (head, framing) = output(&mut req, true);
        assert_eq!(framing, Framing::CloseDelimited);
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
    }

    #[test]
    fn forbidden_body_statuses() {
        for status in [204u16, 304] {
            let mut req = HttpRequest::new();
            req.status = Some(status);
            let (_, framing) = output(&mut req, true);
            assert_eq!(framing, Framing::Forbidden, "{status}");
        }
    }

    #[test]
    fn close_requested() {
        let mut req = HttpRequest::new();
        req.status = Some(404);
        req.response_headers.append("Content-Length", "0");

        let (head, _) = output(&mut req, false);
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn unknown_status_has_no_reason() {
        let mut req = HttpRequest::new();
        req.status = Some(599);
        req.response_headers.append("Content-Length", "0");

        let (head, _) = output(&mut req, true);
        assert!(head.starts_with("HTTP/1.1 599\r\n"), "{head}");
    }

    #[test]
    fn set_cookie_entries_serialize_separately() {
        let mut req = HttpRequest::new();
        req.status = Some(200);
        req.response_headers.append("Content-Length", "0");
        req.response_headers.append("Set-Cookie", "a=1");
        req.response_headers.append("Set-Cookie", "b=2");

        let (head, _) = output(&mut req, true);
        assert!(head.contains("Set-Cookie: a=1\r\n"));
        assert!(head.contains("Set-Cookie: b=2\r\n"));
    }
}

#[cfg(test)]
mod page_tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn error_page_names_the_status() {
        let page = default_error_page(404);
        assert_eq!(
            str_op(&page),
            "<html><head><title>404 Not Found</title></head>\
             <body><h1>404 Not Found</h1></body></html>\n"
        );
    }
}

#[cfg(test)]
mod date_tests {
    use super::*;

    #[test]
    fn stable_within_a_second() {
        let cache = DateCache::new();
        let first = cache.http_date();
        let second = cache.http_date();
        assert_eq!(first, second);
        assert!(first.ends_with(" GMT"), "{first}");
    }
}

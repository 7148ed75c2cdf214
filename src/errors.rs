use std::{error, fmt, io};

/// Failures raised while reading, parsing, or vetting a request, before a
/// handler ever runs. Each maps to a complete canned HTTP response.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    BadRequest,
    HeaderLimit,
    LengthRequired,
    ExpectationFailed,
    ReadTimeout,
    UnsupportedVersion,
    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_line:expr, $len:literal;)*) => {
        /// The full wire response for this error. All error replies close
        /// the connection.
        pub(crate) const fn as_http(&self) -> &'static [u8] {
            match self { $(
                Self::$name { .. } => concat!(
                    "HTTP/1.1 ", $status_line, "\r\n",
                    "Connection: close\r\n",
                    "Content-Type: text/html\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "\r\n",
                    "<html><head><title>", $status_line,
                    "</title></head><body><h1>", $status_line,
                    "</h1></body></html>\n"
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        BadRequest:         "400 Bad Request", "94";
        HeaderLimit:        "413 Payload Too Large", "106";
        LengthRequired:     "411 Length Required", "102";
        ExpectationFailed:  "417 Expectation Failed", "108";
        ReadTimeout:        "408 Request Timeout", "102";
        UnsupportedVersion: "505 HTTP Version Not Supported", "124";
        ServiceUnavailable: "503 Service Unavailable", "110";
        Io:                 "500 Internal Server Error", "114";
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[cfg(test)]
mod as_http_tests {
    use super::*;
    use crate::tools::*;

    fn all() -> Vec<ErrorKind> {
        vec![
            ErrorKind::BadRequest,
            ErrorKind::HeaderLimit,
            ErrorKind::LengthRequired,
            ErrorKind::ExpectationFailed,
            ErrorKind::ReadTimeout,
            ErrorKind::UnsupportedVersion,
            ErrorKind::ServiceUnavailable,
            ErrorKind::Io(IoError(io::Error::from(io::ErrorKind::Other))),
        ]
    }

    #[test]
    fn content_length_matches_body() {
        for err in all() {
            let raw = str_op(err.as_http());
            let (head, body) = raw.split_once("\r\n\r\n").unwrap();

            let declared: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .unwrap()
                .parse()
                .unwrap();

            assert_eq!(declared, body.len(), "{err:?}: {raw}");
        }
    }

    #[test]
    fn status_lines() {
        #[rustfmt::skip]
        let cases = [
            (ErrorKind::BadRequest,        "HTTP/1.1 400 Bad Request\r\n"),
            (ErrorKind::HeaderLimit,       "HTTP/1.1 413 Payload Too Large\r\n"),
            (ErrorKind::LengthRequired,    "HTTP/1.1 411 Length Required\r\n"),
            (ErrorKind::ExpectationFailed, "HTTP/1.1 417 Expectation Failed\r\n"),
            (ErrorKind::ReadTimeout,       "HTTP/1.1 408 Request Timeout\r\n"),
        ];

        for (err, prefix) in cases {
            assert!(str_op(err.as_http()).starts_with(prefix), "{err:?}");
            assert!(str_op(err.as_http()).contains("Connection: close\r\n"));
        }
    }
}

//! Core HTTP protocol types and character classes.

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP response status codes known to the server.
        ///
        /// Backends (e.g. a FastCGI application's `Status:` header) may
        /// produce codes outside this set; those travel as raw `u16` and
        /// serialize with an empty reason phrase.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $name = $num,
        )+ }

        impl StatusCode {
            #[inline]
            pub const fn as_u16(self) -> u16 {
                self as u16
            }

            pub const fn from_u16(code: u16) -> Option<StatusCode> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }

        /// Reason phrase for `code`, or `""` for codes outside the table.
        pub const fn reason_phrase(code: u16) -> &'static str {
            match code { $(
                $num => $str,
            )+
                _ => "",
            }
        }
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    PartialContent = (206, "Partial Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    RequestTimeout = (408, "Request Timeout");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PreconditionFailed = (412, "Precondition Failed");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    RangeNotSatisfiable = (416, "Range Not Satisfiable");
    ExpectationFailed = (417, "Expectation Failed");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

/// Statuses that must not carry a response body.
#[inline]
pub const fn content_forbidden(code: u16) -> bool {
    matches!(code, 100..=199 | 204 | 304)
}

// CHARACTER CLASSES (RFC 7230)

#[inline]
pub(crate) const fn is_char(ch: u8) -> bool {
    ch < 127
}

#[inline]
pub(crate) const fn is_ctl(ch: u8) -> bool {
    ch <= 31 || ch == 127
}

#[inline]
pub(crate) const fn is_tspecial(ch: u8) -> bool {
    matches!(
        ch,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

/// `token` characters: printable ASCII minus separators.
#[inline]
pub(crate) const fn is_token(ch: u8) -> bool {
    is_char(ch) && !is_ctl(ch) && !is_tspecial(ch)
}

#[cfg(test)]
mod status_tests {
    use super::*;

    #[test]
    fn round_trip() {
        #[rustfmt::skip]
        let cases = [
            (StatusCode::Ok,                 200, "OK"),
            (StatusCode::NotFound,           404, "Not Found"),
            (StatusCode::LengthRequired,     411, "Length Required"),
            (StatusCode::PayloadTooLarge,    413, "Payload Too Large"),
            (StatusCode::ExpectationFailed,  417, "Expectation Failed"),
            (StatusCode::BadGateway,         502, "Bad Gateway"),
            (StatusCode::ServiceUnavailable, 503, "Service Unavailable"),
        ];

        for (status, num, reason) in cases {
            assert_eq!(status.as_u16(), num);
            assert_eq!(StatusCode::from_u16(num), Some(status));
            assert_eq!(reason_phrase(num), reason);
        }

        assert_eq!(StatusCode::from_u16(599), None);
        assert_eq!(reason_phrase(599), "");
    }

    #[test]
    fn forbidden_body() {
        for code in [100, 101, 150, 204, 304] {
            assert!(content_forbidden(code), "{code}");
        }
        for code in [200, 201, 301, 302, 400, 404, 500] {
            assert!(!content_forbidden(code), "{code}");
        }
    }
}

#[cfg(test)]
mod class_tests {
    use super::*;

    #[test]
    fn token_chars() {
        for ch in *b"GETPOSTabc-_.!09" {
            assert!(is_token(ch), "{}", ch as char);
        }
        for ch in *b" \t:;/()<>@,\\\"[]?={}" {
            assert!(!is_token(ch), "{}", ch as char);
        }
        assert!(!is_token(0x00));
        assert!(!is_token(0x7f));
    }
}

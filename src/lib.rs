//! origin_web - modular HTTP/1.1 origin server with a FastCGI gateway
//!
//! An event-driven HTTP/1.1 server built around three pieces:
//!
//! - **Incremental zero-copy parsing**: request lines, headers, and bodies
//!   (identity and chunked) are parsed straight out of the connection's
//!   read buffer; header names and values are [`ByteRef`] slices into it,
//!   copied only when something outlives the request.
//! - **A chained response writer**: handlers enqueue byte
//!   [`Source`](io::Source)s (buffers, open file regions with a
//!   `sendfile` fast path, callbacks, filtered streams) that drain
//!   through an ordered composite queue into the socket, optionally
//!   through compression filters.
//! - **A FastCGI gateway**: each routed request opens its own backend
//!   connection, speaks the FastCGI record protocol, and bridges the
//!   backend's CGI response into the HTTP response with backpressure on
//!   both sides.
//!
//! # Architecture
//!
//! One listener accepts sockets and hands each to the least-loaded
//! worker. Every worker is a thread running a single-threaded event
//! loop; a connection, its requests, and any FastCGI transport stay on
//! that worker for life, so per-connection state needs no locks.
//! Requests on one connection are strictly pipelined: the next request
//! is not parsed past its first byte until the current response is
//! finished and on the wire.
//!
//! # Quick start
//!
//! ```no_run
//! use origin_web::{Server, Request, StatusCode};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(|req: &Request| {
//!             req.set_status(StatusCode::Ok);
//!             req.set_header("Content-Length", "13");
//!             req.write_buffer(&b"Hello, world\n"[..]);
//!             req.finish();
//!             true
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! Routing to a FastCGI backend is one more pipeline stage:
//!
//! ```no_run
//! use origin_web::fastcgi::{FastCgiHandler, SocketSpec};
//!
//! let handler = FastCgiHandler::new("127.0.0.1:9000".parse::<SocketSpec>().unwrap());
//! ```

pub mod buffer;
pub(crate) mod errors;
pub mod fastcgi;
pub(crate) mod http {
    pub(crate) mod parser;
    pub mod request;
    pub(crate) mod response;
    pub mod types;
}
pub mod io;
pub mod limits;
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod listener;
    pub(crate) mod server;
    pub(crate) mod worker;
}

pub use crate::{
    buffer::{Buffer, ByteRef, SharedBuffer},
    http::{
        request::{CustomData, HeaderList, OutputState},
        types::{reason_phrase, StatusCode},
    },
    server::{
        connection::Request,
        server::{Handler, Pipeline, Server, ServerBuilder},
    },
};

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }
}

//! Server assembly: builder, handler pipeline, launch.

use crate::limits::{ConnLimits, ReqLimits, ServerLimits};
use crate::server::connection::Request;
use crate::server::listener;
use crate::server::worker::Worker;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::net::TcpListener;

/// One stage of the request-processing pipeline.
///
/// Handlers run in registration order until one returns `true`, taking
/// ownership of the request; that handler must eventually call
/// [`Request::finish`], possibly from a task it spawned (the FastCGI
/// gateway does exactly that). If nobody takes the request it finishes
/// as 404.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> bool;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> bool {
        self(request)
    }
}

/// Ordered handler chain shared by every worker.
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Box<dyn Handler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    pub fn push(&mut self, handler: impl Handler) {
        self.handlers.push(Box::new(handler));
    }

    pub(crate) fn dispatch(&self, request: &Request) -> bool {
        self.handlers.iter().any(|h| h.handle(request))
    }
}

/// The origin server: a listener, N worker event loops, and a handler
/// pipeline.
///
/// ```no_run
/// use origin_web::{Server, StatusCode};
/// use tokio::net::TcpListener;
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(|req: &origin_web::Request| {
///             req.set_status(StatusCode::Ok);
///             req.set_header("Content-Length", "6");
///             req.write_buffer(&b"hello\n"[..]);
///             req.finish();
///             true
///         })
///         .build()
///         .launch()
///         .await;
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    pipeline: Pipeline,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            pipeline: Pipeline::new(),
            server_limits: None,
            conn_limits: None,
            req_limits: None,
        }
    }

    /// Starts the workers and accepts connections forever.
    pub async fn launch(self) {
        let Server {
            listener,
            pipeline,
            server_limits,
            conn_limits,
            req_limits,
        } = self;

        if conn_limits.tcp_defer_accept {
            listener::set_defer_accept(&listener);
        }

        let pipeline = Arc::new(pipeline);
        let connection_ids = Arc::new(AtomicU64::new(1));
        let mut handles = Vec::new();

        for id in 0..server_limits.workers.max(1) {
            let worker = Worker::new(id);
            handles.push(worker.handle.clone());
            worker.spawn(
                conn_limits.clone(),
                req_limits.clone(),
                server_limits.wait_strategy.clone(),
                pipeline.clone(),
                connection_ids.clone(),
            );
        }

        tracing::info!(
            workers = handles.len(),
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "listening"
        );
        listener::accept_loop(listener, handles, server_limits).await;
    }
}

/// Builder for [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    pipeline: Pipeline,
    server_limits: Option<ServerLimits>,
    conn_limits: Option<ConnLimits>,
    req_limits: Option<ReqLimits>,
}

impl ServerBuilder {
    /// The bound listener to accept from. **Required.**
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Appends a pipeline stage. At least one is **required**; stages run
    /// in registration order.
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.pipeline.push(handler);
        self
    }

    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = Some(limits);
        self
    }

    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.req_limits = Some(limits);
        self
    }

    /// # Panics
    ///
    /// Panics when `listener` was not set or no handler was registered.
    #[track_caller]
    pub fn build(self) -> Server {
        assert!(
            !self.pipeline.handlers.is_empty(),
            "at least one handler must be registered"
        );
        Server {
            listener: self
                .listener
                .expect("the `listener` method must be called before build"),
            pipeline: self.pipeline,
            server_limits: self.server_limits.unwrap_or_default(),
            conn_limits: self.conn_limits.unwrap_or_default(),
            req_limits: self.req_limits.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod e2e_tests {
    use super::*;
    use crate::http::types::StatusCode;
    use crate::tools::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn hello_handler(req: &Request) -> bool {
        req.set_status(StatusCode::Ok);
        req.set_header("Content-Length", "6");
        req.write_buffer(&b"hello\n"[..]);
        req.finish();
        true
    }

    fn echo_handler(req: &Request) -> bool {
        if req.path() != b"/echo" as &[u8] {
            return false;
        }
        req.set_status(StatusCode::Ok);
        if let Some(len) = req.content_length() {
            req.set_header("Content-Length", &len.to_string());
        }
        let r = req.clone();
        req.read_body(move |chunk| {
            if chunk.is_empty() {
                r.finish();
            } else {
                r.write_buffer(chunk.to_vec());
            }
        });
        true
    }

    async fn start(build: impl FnOnce(ServerBuilder) -> ServerBuilder) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let limits = ServerLimits {
            workers: 1,
            ..ServerLimits::default()
        };
        let server = build(Server::builder().listener(listener).server_limits(limits)).build();
        tokio::spawn(server.launch());
        addr
    }

    /// Writes a request and collects everything until the server closes.
    async fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(request).await;
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        str_op(&response).to_owned()
    }

    /// Reads one `Content-Length`-framed response off a live stream.
    async fn read_response(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert_eq!(n, 1, "connection closed mid-headers");
            raw.push(byte[0]);
        }
        let head = str_op(&raw).to_owned();
        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.unwrap();
        head + str_op(&body)
    }

    #[tokio::test]
    async fn http10_hello_closes_connection() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(addr, b"GET / HTTP/1.0\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Content-Length: 6\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.contains("Date: "));
        assert!(response.contains("Server: origin_web/"));
        assert!(response.ends_with("\r\n\r\nhello\n"));
    }

    #[tokio::test]
    async fn pipelined_requests_answered_in_order_and_kept_open() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let first = read_response(&mut stream).await;
        let second = read_response(&mut stream).await;
        assert!(first.contains("Connection: keep-alive\r\n"), "{first}");
        assert!(first.ends_with("hello\n"));
        assert!(second.ends_with("hello\n"));

        // Still open: a third request on the same connection works.
        stream
            .write_all(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let third = read_response(&mut stream).await;
        assert!(third.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let addr = start(|b| b.handler(echo_handler).handler(hello_handler)).await;
        let response = roundtrip(
            addr,
            b"POST /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\nContent-Length: 5\r\n\r\nHELLO",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\nHELLO"));
    }

    #[tokio::test]
    async fn unclaimed_request_gets_default_404_page() {
        let addr = start(|b| b.handler(echo_handler)).await;
        let response = roundtrip(addr, b"GET /missing HTTP/1.0\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
        assert!(response.contains("<h1>404 Not Found</h1>"));
    }

    #[tokio::test]
    async fn header_flood_answers_413() {
        let addr = start(|b| b.handler(hello_handler)).await;

        // Enough lines to blow the header-count cap while still fitting
        // the socket buffer in one write.
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..200 {
            request.extend_from_slice(format!("X-Flood-{i}: x\r\n").as_bytes());
        }
        let response = roundtrip(addr, &request).await;
        assert!(
            response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn malformed_request_line_answers_400() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(addr, b"GET / HTTX/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    }

    #[tokio::test]
    async fn unsupported_version_answers_505() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(addr, b"GET / HTTP/2.0\r\nHost: x\r\n\r\n").await;
        assert!(
            response.starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn post_without_length_answers_411() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(addr, b"POST /upload HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(
            response.starts_with("HTTP/1.1 411 Length Required\r\n"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn length_check_precedes_expectation() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(
            addr,
            b"POST /upload HTTP/1.1\r\nHost: x\r\nExpect: bogus\r\n\r\n",
        )
        .await;
        assert!(
            response.starts_with("HTTP/1.1 411 Length Required\r\n"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn body_check_precedes_expectation() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(
            addr,
            b"GET / HTTP/1.1\r\nHost: x\r\nExpect: bogus\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    }

    #[tokio::test]
    async fn host_port_is_stripped_from_hostname() {
        let naming = |req: &Request| -> bool {
            req.set_status(StatusCode::Ok);
            req.set_header("Content-Length", "0");
            req.set_header("X-Seen-Host", &req.hostname());
            req.write_buffer(Vec::new());
            req.finish();
            true
        };
        let addr = start(move |b| b.handler(naming)).await;
        let response = roundtrip(
            addr,
            b"GET / HTTP/1.0\r\nHost: example.org:8080\r\n\r\n",
        )
        .await;
        assert!(response.contains("X-Seen-Host: example.org\r\n"), "{response}");
    }

    #[tokio::test]
    async fn expect_from_http10_answers_417() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(
            addr,
            b"GET / HTTP/1.0\r\nExpect: 100-continue\r\n\r\n",
        )
        .await;
        assert!(
            response.starts_with("HTTP/1.1 417 Expectation Failed\r\n"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn get_with_body_answers_400() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(
            addr,
            b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    }

    #[tokio::test]
    async fn expect_continue_gets_interim_response() {
        let addr = start(|b| b.handler(echo_handler)).await;
        let response = roundtrip(
            addr,
            b"POST /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\
              Expect: 100-continue\r\nContent-Length: 2\r\n\r\nok",
        )
        .await;

        assert!(
            response.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"),
            "{response}"
        );
        assert!(response.ends_with("ok"));
    }

    #[tokio::test]
    async fn head_suppresses_body() {
        let addr = start(|b| b.handler(hello_handler)).await;
        let response = roundtrip(addr, b"HEAD / HTTP/1.0\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Content-Length: 6\r\n"));
        assert!(response.ends_with("\r\n\r\n"), "{response}");
    }

    #[tokio::test]
    async fn body_without_length_goes_chunked() {
        let streaming = |req: &Request| -> bool {
            req.set_status(StatusCode::Ok);
            req.write_buffer(&b"part1"[..]);
            req.write_buffer(&b"part2"[..]);
            req.finish();
            true
        };
        let addr = start(move |b| b.handler(streaming)).await;
        let response = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;

        assert!(response.contains("Transfer-Encoding: chunked\r\n"), "{response}");
        assert!(response.ends_with("5\r\npart1\r\n5\r\npart2\r\n0\r\n\r\n"), "{response}");
    }

    #[tokio::test]
    async fn slow_request_answers_408() {
        let conn_limits = ConnLimits {
            max_read_idle: Duration::from_millis(200),
            ..ConnLimits::default()
        };
        let addr = start(move |b| b.handler(hello_handler).connection_limits(conn_limits)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HT").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(
            str_op(&response).starts_with("HTTP/1.1 408 Request Timeout\r\n"),
            "{}",
            str_op(&response)
        );
    }

    #[tokio::test]
    async fn bytes_transmitted_covers_headers_and_body() {
        let (tx, rx) = std::sync::mpsc::channel::<u64>();
        let tx = std::sync::Mutex::new(tx);

        let counting = move |req: &Request| -> bool {
            req.set_status(StatusCode::Ok);
            req.set_header("Content-Length", "6");
            req.write_buffer(&b"hello\n"[..]);
            req.finish();

            // Fires once everything queued before it reached the socket.
            let snapshot = req.clone();
            let tx = tx.lock().unwrap().clone();
            req.write_callback(move || {
                let _ = tx.send(snapshot.bytes_transmitted());
            });
            true
        };

        let addr = start(move |b| b.handler(counting)).await;
        let response = roundtrip(addr, b"GET / HTTP/1.0\r\n\r\n").await;

        let transmitted = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(transmitted, response.len() as u64, "{response}");

        // Identity framing: headers plus exactly Content-Length bytes.
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert_eq!(transmitted, (head.len() + 4 + body.len()) as u64);
        assert_eq!(body.len(), 6);
    }

    #[tokio::test]
    async fn idle_keep_alive_closes_silently() {
        let conn_limits = ConnLimits {
            max_keep_alive: Duration::from_millis(200),
            ..ConnLimits::default()
        };
        let addr = start(move |b| b.handler(hello_handler).connection_limits(conn_limits)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let first = read_response(&mut stream).await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

        // No second request: the server closes without any bytes.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "{:?}", str_op(&rest));
    }
}

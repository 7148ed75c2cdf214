//! FastCGI gateway: one backend connection per routed HTTP request.
//!
//! The handler spawns a transport task on the request's worker. The
//! transport encodes the CGI environment and request body as FastCGI
//! records, pumps backend records back, and feeds stdout through a
//! message-mode HTTP parser into the response. When the HTTP side's
//! output backs up, the transport stops reading from the backend until a
//! write-completion callback releases it; a client abort forwards an
//! `AbortRequest` record.

use crate::fastcgi::record::{
    encode_begin_request, encode_record, parse_params, EndRequestBody, RecordHeader, RecordType,
    FCGI_VERSION, HEADER_LEN, PROTO_REQUEST_COMPLETE,
};
use crate::http::parser::{MessageHandler, MessageParser, ParseMode};
use crate::http::request::OutputState;
use crate::http::response::SERVER_SOFTWARE;
use crate::server::connection::Request;
use crate::server::server::Handler;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Notify;

/// Backend address: TCP endpoint or Unix-domain socket path
/// (`unix:/run/app.sock`).
#[derive(Debug, Clone)]
pub enum SocketSpec {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketSpec::Tcp(addr) => write!(f, "{addr}"),
            SocketSpec::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for SocketSpec {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("unix:") {
            Some(path) => Ok(SocketSpec::Unix(PathBuf::from(path))),
            None => Ok(SocketSpec::Tcp(s.parse()?)),
        }
    }
}

/// Pipeline stage routing every request it sees to a FastCGI backend.
pub struct FastCgiHandler {
    spec: SocketSpec,
}

impl FastCgiHandler {
    pub fn new(spec: SocketSpec) -> Self {
        FastCgiHandler { spec }
    }
}

impl Handler for FastCgiHandler {
    fn handle(&self, request: &Request) -> bool {
        // Bind synchronously: the body and abort callbacks must be in
        // place before the connection delivers any body chunk.
        let transport = CgiTransport::bind(request.clone());
        tokio::task::spawn_local(transport.run(self.spec.clone()));
        true
    }
}

thread_local! {
    static NEXT_ID: Cell<u16> = const { Cell::new(0) };
}

/// Monotone nonzero FastCGI request id, per worker.
fn next_request_id() -> u16 {
    NEXT_ID.with(|cell| {
        let mut id = cell.get().wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        cell.set(id);
        id
    })
}

enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl BackendStream {
    async fn connect(spec: &SocketSpec) -> io::Result<BackendStream> {
        match spec {
            SocketSpec::Tcp(addr) => Ok(BackendStream::Tcp(TcpStream::connect(addr).await?)),
            SocketSpec::Unix(path) => Ok(BackendStream::Unix(UnixStream::connect(path).await?)),
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BackendStream::Tcp(s) => s.read(buf).await,
            BackendStream::Unix(s) => s.read(buf).await,
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BackendStream::Tcp(s) => s.write(buf).await,
            BackendStream::Unix(s) => s.write(buf).await,
        }
    }
}

/// State shared with the request's body and abort callbacks, which run
/// on the connection driver while the transport task sleeps.
struct TransportShared {
    aborted: Cell<bool>,
    resume_read: Cell<bool>,
    stdin: RefCell<Vec<u8>>,
    notify: Notify,
}

struct CgiTransport {
    request: Request,
    id: u16,
    backend_name: String,
    shared: Rc<TransportShared>,
    parser: MessageParser,
    write_buf: Vec<u8>,
    stdout: Vec<u8>,
    stdout_off: usize,
    read_buf: Vec<u8>,
    read_off: usize,
    reading: bool,
    saw_end: bool,
    abort_sent: bool,
    configured: bool,
}

impl CgiTransport {
    /// Synchronous part of request takeover: allocates the FastCGI id,
    /// stages BeginRequest/Params/stdin-EOS, and registers the body and
    /// abort callbacks. Runs inside handler dispatch, before the
    /// connection delivers any body bytes.
    fn bind(request: Request) -> CgiTransport {
        let id = next_request_id();
        let shared = Rc::new(TransportShared {
            aborted: Cell::new(false),
            resume_read: Cell::new(false),
            stdin: RefCell::new(Vec::new()),
            notify: Notify::new(),
        });

        {
            let shared = shared.clone();
            request.set_abort_handler(move || {
                shared.aborted.set(true);
                shared.notify.notify_one();
            });
        }

        let mut write_buf = Vec::with_capacity(1024);
        encode_begin_request(&mut write_buf, id, true);
        encode_record(&mut write_buf, RecordType::Params, id, &build_params(&request));
        encode_record(&mut write_buf, RecordType::Params, id, b"");

        if request.content_available() {
            let shared = shared.clone();
            request.read_body(move |chunk| {
                encode_record(
                    &mut shared.stdin.borrow_mut(),
                    RecordType::StdIn,
                    id,
                    &chunk.to_vec(),
                );
                shared.notify.notify_one();
            });
        } else {
            // Backends expect the stdin end-of-stream marker regardless.
            encode_record(&mut write_buf, RecordType::StdIn, id, b"");
        }

        CgiTransport {
            request,
            id,
            backend_name: String::new(),
            shared,
            parser: MessageParser::new(ParseMode::Message, 16 * 1024, 256, 16 * 1024),
            write_buf,
            stdout: Vec::new(),
            stdout_off: 0,
            read_buf: Vec::new(),
            read_off: 0,
            reading: true,
            saw_end: false,
            abort_sent: false,
            configured: false,
        }
    }

    async fn run(mut self, spec: SocketSpec) {
        self.backend_name = spec.to_string();

        let mut backend = match BackendStream::connect(&spec).await {
            Ok(backend) => backend,
            Err(err) => {
                tracing::error!(backend = %spec, error = %err, "fastcgi: connect to backend failed");
                return self.fail(503);
            }
        };

        let write_buf = std::mem::take(&mut self.write_buf);
        self.pump(&mut backend, write_buf).await;
    }

    /// The transport's I/O loop: flush queued records to the backend,
    /// then wait for backend bytes or a callback wakeup.
    async fn pump(&mut self, backend: &mut BackendStream, mut write_buf: Vec<u8>) {
        let mut write_pos = 0;
        let mut scratch = vec![0u8; 16 * 1024];

        loop {
            {
                let mut stdin = self.shared.stdin.borrow_mut();
                if !stdin.is_empty() {
                    write_buf.extend_from_slice(&stdin);
                    stdin.clear();
                }
            }
            if self.shared.aborted.get() && !self.abort_sent {
                self.abort_sent = true;
                encode_record(&mut write_buf, RecordType::AbortRequest, self.id, b"");
            }

            while write_pos < write_buf.len() {
                match backend.write(&write_buf[write_pos..]).await {
                    Ok(0) => return self.fail(502),
                    Ok(n) => write_pos += n,
                    Err(err) => {
                        tracing::error!(
                            backend = %self.backend_name,
                            error = %err,
                            "fastcgi: write to backend failed"
                        );
                        return self.fail(502);
                    }
                }
            }
            write_buf.clear();
            write_pos = 0;

            if self.shared.resume_read.replace(false) {
                self.reading = true;
            }
            if self.saw_end {
                return;
            }

            let shared = self.shared.clone();
            tokio::select! {
                biased;
                _ = shared.notify.notified() => {}
                result = backend.read(&mut scratch), if self.reading => match result {
                    Ok(0) => {
                        tracing::error!(
                            backend = %self.backend_name,
                            "fastcgi: connection to backend lost"
                        );
                        return self.fail(502);
                    }
                    Ok(n) => {
                        self.read_buf.extend_from_slice(&scratch[..n]);
                        if self.process_records().is_err() {
                            return self.fail(502);
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            backend = %self.backend_name,
                            error = %err,
                            "fastcgi: read from backend failed"
                        );
                        return self.fail(502);
                    }
                },
            }
        }
    }

    /// Consumes every complete record buffered so far; incomplete tails
    /// wait for the next read.
    fn process_records(&mut self) -> Result<(), ()> {
        while !self.saw_end {
            let avail = self.read_buf.len() - self.read_off;
            if avail < HEADER_LEN {
                break;
            }
            let header = RecordHeader::parse(&self.read_buf[self.read_off..]).ok_or(())?;
            if header.version != FCGI_VERSION {
                tracing::error!(
                    backend = %self.backend_name,
                    version = header.version,
                    "fastcgi: bad protocol version"
                );
                return Err(());
            }
            if avail < header.total_len() {
                break;
            }

            let content = self.read_off + HEADER_LEN
                ..self.read_off + HEADER_LEN + header.content_length as usize;
            self.read_off += header.total_len();

            match RecordType::from_u8(header.record_type) {
                Some(RecordType::StdOut) => self.on_stdout(content)?,
                Some(RecordType::StdErr) => {
                    let text = String::from_utf8_lossy(&self.read_buf[content]);
                    tracing::error!("fastcgi: {}", text.trim_end_matches('\n'));
                }
                Some(RecordType::EndRequest) => {
                    self.on_end_request(EndRequestBody::parse(&self.read_buf[content]));
                }
                Some(RecordType::GetValuesResult) => {
                    let Some(values) = parse_params(&self.read_buf[content]) else {
                        return Err(());
                    };
                    if !self.configured {
                        self.configured = true;
                        tracing::debug!(
                            backend = %self.backend_name,
                            values = values.len(),
                            "fastcgi: backend configured"
                        );
                    }
                }
                other => {
                    tracing::warn!(
                        backend = %self.backend_name,
                        record_type = header.record_type,
                        known = other.is_some(),
                        "fastcgi: unexpected record from backend"
                    );
                }
            }
        }

        if self.read_off == self.read_buf.len() {
            self.read_buf.clear();
            self.read_off = 0;
        }
        Ok(())
    }

    /// Stdout bytes feed the embedded response parser. If the HTTP side
    /// is backpressured afterwards, backend reads pause until the output
    /// queue has drained past what we enqueued.
    fn on_stdout(&mut self, content: Range<usize>) -> Result<(), ()> {
        self.stdout.extend_from_slice(&self.read_buf[content]);

        let mut events = CgiResponseEvents {
            request: &self.request,
        };
        match self.parser.parse(&mut self.stdout, self.stdout_off, &mut events) {
            Ok(consumed) => self.stdout_off += consumed,
            Err(err) => {
                tracing::error!(
                    backend = %self.backend_name,
                    error = ?err,
                    "fastcgi: malformed response from backend"
                );
                return Err(());
            }
        }
        if self.parser.headers_done() && self.stdout_off == self.stdout.len() {
            self.stdout.clear();
            self.stdout_off = 0;
        }

        if self.request.output_pending() {
            self.reading = false;
            let shared = self.shared.clone();
            self.request.write_callback(move || {
                shared.resume_read.set(true);
                shared.notify.notify_one();
            });
        }
        Ok(())
    }

    fn on_end_request(&mut self, body: Option<EndRequestBody>) {
        self.saw_end = true;
        if let Some(body) = body {
            if body.protocol_status != PROTO_REQUEST_COMPLETE {
                tracing::warn!(
                    backend = %self.backend_name,
                    protocol_status = body.protocol_status,
                    "fastcgi: request did not complete normally"
                );
            }
        }
        if self.request.status().is_none()
            && !self.request.is_aborted()
            && self.request.output_state() == OutputState::Unhandled
        {
            self.request.set_status_raw(503);
        }
        self.request.finish();
    }

    fn fail(&self, status: u16) {
        fail_request(&self.request, status);
    }
}

/// Error exit: a status rewrite is only possible while the response is
/// untouched; either way the request is finished.
fn fail_request(request: &Request, status: u16) {
    if !request.is_aborted() && request.output_state() == OutputState::Unhandled {
        request.set_status_raw(status);
    }
    request.finish();
}

/// The CGI environment for one request, in the FastCGI params encoding.
fn build_params(request: &Request) -> Vec<u8> {
    use crate::fastcgi::record::ParamsWriter;

    let mut params = ParamsWriter::new();
    let local = request.local_addr();
    let remote = request.remote_addr();
    let document_root = request.document_root();
    let pathinfo = request.pathinfo();
    let path = request.path().to_string_lossy();

    params.encode(b"SERVER_SOFTWARE", SERVER_SOFTWARE.as_bytes());
    params.encode(b"SERVER_NAME", request.hostname().as_bytes());
    params.encode(b"GATEWAY_INTERFACE", b"CGI/1.1");

    let (major, minor) = request.version();
    params.encode(b"SERVER_PROTOCOL", format!("HTTP/{major}.{minor}").as_bytes());
    params.encode(b"SERVER_ADDR", local.ip().to_string().as_bytes());
    params.encode(b"SERVER_PORT", local.port().to_string().as_bytes());

    params.encode(b"REQUEST_METHOD", &request.method().to_vec());
    params.encode(b"REDIRECT_STATUS", b"200");

    params.encode(b"SCRIPT_NAME", path.as_bytes());
    params.encode(b"PATH_INFO", pathinfo.as_bytes());
    if !pathinfo.is_empty() {
        let translated = format!("{document_root}{pathinfo}");
        params.encode(b"PATH_TRANSLATED", translated.as_bytes());
    }

    params.encode(b"QUERY_STRING", &request.query().to_vec());
    params.encode(b"REQUEST_URI", &request.uri().to_vec());

    params.encode(b"REMOTE_ADDR", remote.ip().to_string().as_bytes());
    params.encode(b"REMOTE_PORT", remote.port().to_string().as_bytes());

    if request.content_available() {
        if let Some(content_type) = request.request_header(b"Content-Type") {
            params.encode(b"CONTENT_TYPE", &content_type.to_vec());
        }
        if let Some(length) = request.content_length() {
            params.encode(b"CONTENT_LENGTH", length.to_string().as_bytes());
        }
    }
    if request.is_secure() {
        params.encode(b"HTTPS", b"on");
    }

    for (name, value) in request.request_headers() {
        let mut key = Vec::with_capacity(5 + name.len());
        key.extend_from_slice(b"HTTP_");
        for &b in name.bytes().iter() {
            key.push(if b.is_ascii_alphanumeric() {
                b.to_ascii_uppercase()
            } else {
                b'_'
            });
        }
        params.encode(&key, &value.to_vec());
    }

    params.encode(b"DOCUMENT_ROOT", document_root.as_bytes());
    let filename = format!("{document_root}{path}");
    params.encode(b"SCRIPT_FILENAME", filename.as_bytes());

    params.output()
}

/// Parser events for the backend's CGI response: `Status:` becomes the
/// response status, `Location:` defaults it to 302, everything else is
/// forwarded; content streams into the response body.
struct CgiResponseEvents<'a> {
    request: &'a Request,
}

impl MessageHandler for CgiResponseEvents<'_> {
    fn on_message_header(
        &mut self,
        name: &[u8],
        _: Range<usize>,
        value: &[u8],
        _: Range<usize>,
    ) -> bool {
        if name.eq_ignore_ascii_case(b"Status") {
            let digits = value.iter().take_while(|b| b.is_ascii_digit()).count();
            if let Some(code) = std::str::from_utf8(&value[..digits])
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
            {
                self.request.set_status_raw(code);
            }
        } else {
            if name.eq_ignore_ascii_case(b"Location") && self.request.status().is_none() {
                self.request.set_status_raw(302);
            }
            self.request.append_header(
                &String::from_utf8_lossy(name),
                &String::from_utf8_lossy(value),
            );
        }
        true
    }

    fn on_message_header_end(&mut self) -> bool {
        if self.request.status().is_none() {
            self.request.set_status_raw(200);
        }
        true
    }

    fn on_message_content(&mut self, chunk: &[u8], _: Range<usize>) -> bool {
        self.request.write_buffer(chunk.to_vec());
        true
    }
}

#[cfg(test)]
mod gateway_tests {
    use super::*;
    use crate::limits::ServerLimits;
    use crate::server::server::{Server, ServerBuilder};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    /// Pulls complete records off a byte stream.
    struct RecordCollector {
        buf: Vec<u8>,
        off: usize,
    }

    impl RecordCollector {
        fn new() -> Self {
            RecordCollector {
                buf: Vec::new(),
                off: 0,
            }
        }

        fn push(&mut self, data: &[u8]) {
            self.buf.extend_from_slice(data);
        }

        fn next(&mut self) -> Option<(RecordHeader, Vec<u8>)> {
            let avail = self.buf.len() - self.off;
            if avail < HEADER_LEN {
                return None;
            }
            let header = RecordHeader::parse(&self.buf[self.off..])?;
            if avail < header.total_len() {
                return None;
            }
            let start = self.off + HEADER_LEN;
            let content = self.buf[start..start + header.content_length as usize].to_vec();
            self.off += header.total_len();
            Some((header, content))
        }
    }

    /// One-shot backend: collects the request, then answers with `head`
    /// followed by the received stdin, then EndRequest.
    async fn scripted_backend(listener: TcpListener, head: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut collector = RecordCollector::new();
        let mut stdin = Vec::new();
        let mut request_id = 0;
        let mut scratch = [0u8; 4096];

        'read: loop {
            let n = stream.read(&mut scratch).await.unwrap();
            assert_ne!(n, 0, "transport closed before request was complete");
            collector.push(&scratch[..n]);

            while let Some((header, content)) = collector.next() {
                request_id = header.request_id;
                match RecordType::from_u8(header.record_type) {
                    Some(RecordType::StdIn) if content.is_empty() => break 'read,
                    Some(RecordType::StdIn) => stdin.extend_from_slice(&content),
                    _ => {}
                }
            }
        }

        let mut reply = Vec::new();
        let mut payload = head.as_bytes().to_vec();
        payload.extend_from_slice(&stdin);
        encode_record(&mut reply, RecordType::StdOut, request_id, &payload);
        encode_record(
            &mut reply,
            RecordType::EndRequest,
            request_id,
            &EndRequestBody {
                app_status: 0,
                protocol_status: PROTO_REQUEST_COMPLETE,
            }
            .encode(),
        );
        stream.write_all(&reply).await.unwrap();
    }

    async fn start_gateway(backend_addr: SocketAddr) -> SocketAddr {
        start_gateway_with(backend_addr, |b| b).await
    }

    async fn start_gateway_with(
        backend_addr: SocketAddr,
        build: impl FnOnce(ServerBuilder) -> ServerBuilder,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let limits = ServerLimits {
            workers: 1,
            ..ServerLimits::default()
        };
        let server = build(
            Server::builder()
                .listener(listener)
                .server_limits(limits)
                .handler(FastCgiHandler::new(SocketSpec::Tcp(backend_addr))),
        )
        .build();
        tokio::spawn(server.launch());
        addr
    }

    async fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(request).await;
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn chunked_post_echoes_through_gateway() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(scripted_backend(
            backend,
            "Status: 200 OK\r\nContent-Type: text/plain\r\n\r\n",
        ));

        let addr = start_gateway(backend_addr).await;
        let response = roundtrip(
            addr,
            b"POST /cgi HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\
              Transfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Content-Type: text/plain\r\n"));
        // No Content-Length from the backend, so the body is chunked.
        assert!(response.ends_with("6\r\nfoobar\r\n0\r\n\r\n"), "{response}");
    }

    #[tokio::test]
    async fn backend_status_header_is_mapped() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(scripted_backend(
            backend,
            "Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\n",
        ));

        let addr = start_gateway(backend_addr).await;
        let response = roundtrip(addr, b"GET /missing HTTP/1.0\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    }

    #[tokio::test]
    async fn location_without_status_becomes_302() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(scripted_backend(backend, "Location: /next\r\n\r\n"));

        let addr = start_gateway(backend_addr).await;
        let response = roundtrip(addr, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"), "{response}");
        assert!(response.contains("Location: /next\r\n"));
    }

    #[tokio::test]
    async fn connect_failure_answers_503() {
        // Bind then drop, so the port is (very likely) refusing.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let addr = start_gateway(dead_addr).await;
        let response = roundtrip(addr, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").await;
        assert!(
            response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn backend_eof_before_end_request_answers_502() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept, read a little, slam the door.
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut scratch = [0u8; 1024];
            let _ = stream.read(&mut scratch).await;
        });

        let addr = start_gateway(backend_addr).await;
        let response = roundtrip(addr, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{response}");
    }

    #[tokio::test]
    async fn client_abort_forwards_abort_request() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let (request_seen_tx, request_seen_rx) = oneshot::channel();
        let (abort_seen_tx, abort_seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut collector = RecordCollector::new();
            let mut scratch = [0u8; 4096];
            let mut request_seen_tx = Some(request_seen_tx);
            let mut abort_seen_tx = Some(abort_seen_tx);

            loop {
                let n = stream.read(&mut scratch).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
                collector.push(&scratch[..n]);
                while let Some((header, content)) = collector.next() {
                    match RecordType::from_u8(header.record_type) {
                        Some(RecordType::StdIn) if content.is_empty() => {
                            if let Some(tx) = request_seen_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                        Some(RecordType::AbortRequest) => {
                            if let Some(tx) = abort_seen_tx.take() {
                                let _ = tx.send(());
                            }
                            return;
                        }
                        _ => {}
                    }
                }
            }
        });

        let addr = start_gateway(backend_addr).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (_, mut write_half) = stream.into_split();
        write_half
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        // The backend has the request; now the client vanishes before any
        // response exists.
        timeout(Duration::from_secs(5), request_seen_rx)
            .await
            .expect("backend never saw the request")
            .unwrap();
        drop(write_half);

        timeout(Duration::from_secs(5), abort_seen_rx)
            .await
            .expect("backend never saw AbortRequest")
            .unwrap();
    }
}

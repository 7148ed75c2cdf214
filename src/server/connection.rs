//! Per-socket request lifecycle.
//!
//! Each accepted socket gets one driver task, pinned to its worker's
//! thread. The driver owns the socket and the parser; everything a handler
//! may touch lives in the shared connection core behind an `Rc<RefCell>`.
//! The `Rc` clones held by late-finishing handler tasks (e.g. a FastCGI
//! transport) are what keep the core alive across reentrant callbacks; the
//! driver itself is released only when the socket is closed and the output
//! queue has drained.

use crate::buffer::{Buffer, ByteRef, SharedBuffer};
use crate::errors::ErrorKind;
use crate::http::parser::{MessageHandler, MessageParser, ParseError, ParseMode};
use crate::http::request::{HttpRequest, OutputState};
use crate::http::response::{self, Framing};
use crate::http::types::StatusCode;
use crate::io::filter::Filter;
use crate::io::sink::Sink;
use crate::io::source::{BufferSource, CallbackSource, CompositeSource, FileSource, FilterSource, Source};
use crate::server::server::Pipeline;
use crate::server::worker::WorkerCtx;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

/// Per-tick cap on output drain iterations, for fairness between
/// connections sharing a worker.
const DRAIN_BURST: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConnectionStatus {
    StartingUp,
    ReadingRequest,
    SendingReply,
    KeepAliveRead,
}

/// Shared connection state: everything a handler handle may touch.
pub(crate) struct ConnCore {
    pub(crate) id: u64,
    pub(crate) status: ConnectionStatus,
    pub(crate) aborted: bool,
    pub(crate) closed: bool,
    pub(crate) keep_alive: bool,
    pub(crate) handling: bool,
    pub(crate) close_after_reply: bool,
    pub(crate) secure: bool,
    pub(crate) request: Option<HttpRequest>,
    pub(crate) output: CompositeSource,
    pub(crate) output_notify: Rc<Notify>,
    pub(crate) input: SharedBuffer,
    pub(crate) remote: SocketAddr,
    pub(crate) local: SocketAddr,
    pub(crate) ctx: Rc<WorkerCtx>,
}

impl ConnCore {
    fn notify(&self) {
        self.output_notify.notify_one();
    }
}

/// Handle to the request currently being served on a connection. Cloned
/// freely; handlers that finish a request from a later task keep one.
#[derive(Clone)]
pub struct Request {
    core: Rc<RefCell<ConnCore>>,
}

impl Request {
    pub(crate) fn new(core: Rc<RefCell<ConnCore>>) -> Self {
        Request { core }
    }

    // Request side.

    pub fn method(&self) -> ByteRef {
        self.with_req(|r| r.method.clone())
    }

    pub fn uri(&self) -> ByteRef {
        self.with_req(|r| r.uri.clone())
    }

    pub fn path(&self) -> ByteRef {
        self.with_req(|r| r.path.clone())
    }

    pub fn query(&self) -> ByteRef {
        self.with_req(|r| r.query.clone())
    }

    pub fn version(&self) -> (u8, u8) {
        self.with_req(|r| r.version)
    }

    pub fn hostname(&self) -> String {
        self.with_req(|r| r.hostname.clone())
    }

    /// First request header matching `name`, case-insensitively.
    pub fn request_header(&self, name: &[u8]) -> Option<ByteRef> {
        self.with_req(|r| r.request_header(name))
    }

    /// All request headers, in wire order, duplicates preserved.
    pub fn request_headers(&self) -> Vec<(ByteRef, ByteRef)> {
        self.with_req(|r| r.request_headers.clone())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.with_req(|r| r.content_length)
    }

    pub fn content_available(&self) -> bool {
        self.with_req(|r| r.content_available())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.core.borrow().remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.borrow().local
    }

    pub fn is_secure(&self) -> bool {
        self.core.borrow().secure
    }

    pub fn connection_id(&self) -> u64 {
        self.core.borrow().id
    }

    pub fn document_root(&self) -> String {
        self.with_req(|r| r.document_root.clone())
    }

    pub fn set_document_root(&self, root: &str) {
        self.with_req(|r| r.document_root = root.to_owned());
    }

    pub fn pathinfo(&self) -> String {
        self.with_req(|r| r.pathinfo.clone())
    }

    pub fn set_pathinfo(&self, pathinfo: &str) {
        self.with_req(|r| r.pathinfo = pathinfo.to_owned());
    }

    pub fn username(&self) -> String {
        self.with_req(|r| r.username.clone())
    }

    pub fn set_username(&self, name: &str) {
        self.with_req(|r| r.username = name.to_owned());
    }

    /// Streams the request body: `callback` runs for every received chunk,
    /// in order, and once more with an empty chunk after the last one.
    pub fn read_body(&self, callback: impl FnMut(ByteRef) + 'static) {
        self.with_req(|r| r.body_callback = Some(Box::new(callback)));
    }

    /// Runs once if the peer disconnects before the response completes.
    pub fn set_abort_handler(&self, handler: impl FnOnce() + 'static) {
        self.with_req(|r| r.abort_handler = Some(Box::new(handler)));
    }

    pub fn is_aborted(&self) -> bool {
        self.core.borrow().aborted
    }

    pub fn is_closed(&self) -> bool {
        self.core.borrow().closed
    }

    // Per-plugin custom data.

    pub fn set_custom<T: std::any::Any>(&self, value: T) {
        self.with_req(|r| r.custom_data.set(value));
    }

    pub fn take_custom<T: std::any::Any>(&self) -> Option<T> {
        self.with_req(|r| r.custom_data.take())
    }

    // Response side.

    pub fn status(&self) -> Option<u16> {
        self.with_req(|r| r.status)
    }

    pub fn set_status(&self, status: StatusCode) {
        self.set_status_raw(status.as_u16());
    }

    /// Raw status, for codes relayed from a backend. Ignored once the
    /// headers are staged.
    pub fn set_status_raw(&self, status: u16) {
        self.with_req(|r| {
            if r.output_state == OutputState::Unhandled {
                r.status = Some(status);
            }
        });
    }

    pub fn output_state(&self) -> OutputState {
        self.with_req(|r| r.output_state)
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.with_req(|r| r.bytes_transmitted)
    }

    /// Replaces the first response header with `name`, or adds it.
    /// Headers freeze once staged; later calls are dropped.
    pub fn set_header(&self, name: &str, value: &str) {
        self.with_req(|r| {
            if r.output_state == OutputState::Unhandled {
                r.response_headers.overwrite(name, value);
            }
        });
    }

    /// Adds a response header entry, keeping existing same-named entries.
    /// Each entry serializes on its own line.
    pub fn append_header(&self, name: &str, value: &str) {
        self.with_req(|r| {
            if r.output_state == OutputState::Unhandled {
                r.response_headers.append(name, value);
            }
        });
    }

    pub fn remove_header(&self, name: &str) {
        self.with_req(|r| r.response_headers.remove(name));
    }

    pub fn response_header(&self, name: &str) -> Option<String> {
        self.with_req(|r| r.response_headers.get(name).map(str::to_owned))
    }

    /// Appends an output filter stage (compression etc).
    pub fn add_filter(&self, filter: Filter) {
        self.with_req(|r| r.output_filters.borrow_mut().push(filter));
    }

    pub fn write_buffer(&self, data: impl Into<Vec<u8>>) {
        self.write(Source::Buffer(BufferSource::new(data.into())));
    }

    pub fn write_file(&self, file: std::fs::File, offset: u64, count: u64) {
        self.write(Source::File(FileSource::new(file, offset, count)));
    }

    /// Pushes a response body source. The first write also stages the
    /// status line and headers, freezing them.
    pub fn write(&self, source: Source) {
        let mut guard = self.core.borrow_mut();
        let core = &mut *guard;
        if core.aborted {
            return;
        }
        let Some(req) = core.request.as_mut() else {
            return;
        };

        match req.output_state {
            OutputState::Unhandled => {
                req.output_state = OutputState::Populating;
                let keep_alive = core.keep_alive && !core.close_after_reply;
                let date = core.ctx.date.http_date();
                let (head, framing) = response::serialize(req, keep_alive, &date);
                if framing == Framing::CloseDelimited {
                    core.close_after_reply = true;
                }
                core.output.push_back(Source::Buffer(BufferSource::new(head)));
            }
            OutputState::Populating => {}
            OutputState::Finished => {
                // Late writers (a backend still draining after an error
                // reply) have nowhere to go.
                tracing::trace!("write after finish dropped");
                return;
            }
        }

        if req.is_response_content_forbidden() {
            // HEAD and 1xx/204/304: body bytes are dropped.
        } else if req.output_filters.borrow().is_empty() {
            core.output.push_back(source);
        } else {
            core.output.push_back(Source::Filter(FilterSource::new(
                source,
                req.output_filters.clone(),
                false,
            )));
        }

        core.notify();
    }

    /// Enqueues `callback` behind the pending output, so it runs when all
    /// preceding bytes have reached the socket. Runs immediately (and
    /// returns `false`) if nothing is pending or the peer is gone.
    pub fn write_callback(&self, callback: impl FnOnce() + 'static) -> bool {
        let mut guard = self.core.borrow_mut();
        let core = &mut *guard;
        if !core.aborted && !core.output.is_empty() {
            core.output
                .push_back(Source::Callback(CallbackSource::new(Box::new(callback))));
            core.notify();
            return true;
        }
        drop(guard);
        callback();
        false
    }

    pub fn output_pending(&self) -> bool {
        !self.core.borrow().output.is_empty()
    }

    /// Completes the response. A request that produced no content gets the
    /// default error page for its status (404 if never set); a chunked
    /// response gets its terminator. Transitions to `Finished`, after
    /// which the connection resumes or closes.
    pub fn finish(&self) {
        let mut guard = self.core.borrow_mut();
        let core = &mut *guard;
        let Some(req) = core.request.as_mut() else {
            return;
        };

        match req.output_state {
            OutputState::Finished => return,
            OutputState::Unhandled => {
                if req.status.is_none() {
                    req.status = Some(StatusCode::NotFound.as_u16());
                }
                if !core.aborted {
                    let status = req.status.unwrap_or(200);
                    let page = response::default_error_page(status);
                    if !req.is_response_content_forbidden() {
                        req.response_headers
                            .overwrite("Content-Length", &page.len().to_string());
                    }
                    let keep_alive = core.keep_alive && !core.close_after_reply;
                    let date = core.ctx.date.http_date();
                    let (head, framing) = response::serialize(req, keep_alive, &date);
                    core.output.push_back(Source::Buffer(BufferSource::new(head)));
                    if framing == Framing::Identity && !req.is_response_content_forbidden() {
                        core.output.push_back(Source::Buffer(BufferSource::new(page)));
                    }
                }
            }
            OutputState::Populating => {
                if !core.aborted
                    && (req.chunked_response || !req.output_filters.borrow().is_empty())
                {
                    // Flush stateful filter tails and the chunked
                    // terminator behind everything already queued.
                    core.output.push_back(Source::Filter(FilterSource::new(
                        Source::Buffer(BufferSource::new(Vec::new())),
                        req.output_filters.clone(),
                        true,
                    )));
                }
            }
        }

        req.output_state = OutputState::Finished;
        core.notify();
    }

    fn with_req<R>(&self, f: impl FnOnce(&mut HttpRequest) -> R) -> R {
        let mut core = self.core.borrow_mut();
        let req = core
            .request
            .as_mut()
            .expect("request handle outlived its request");
        f(req)
    }
}

/// Deferred work recorded by parser events; run once the input buffer
/// borrow is released, so user callbacks can resolve ByteRefs freely.
enum Action {
    Dispatch,
    Content(Range<usize>),
    End,
}

/// Parser event receiver: builds the request in the connection core.
/// Never touches input buffer contents (the driver holds that borrow);
/// byte checks use the slices the parser hands over.
struct Events<'a> {
    core: &'a Rc<RefCell<ConnCore>>,
    actions: &'a mut Vec<Action>,
}

impl MessageHandler for Events<'_> {
    fn on_message_begin(
        &mut self,
        _method: &[u8],
        method_span: Range<usize>,
        _uri: &[u8],
        uri_span: Range<usize>,
        version: (u8, u8),
    ) -> bool {
        let mut core = self.core.borrow_mut();
        let input = core.input.clone();

        let mut req = HttpRequest::new();
        req.method = ByteRef::new(input.clone(), method_span.start, method_span.len());
        req.uri = ByteRef::new(input, uri_span.start, uri_span.len());
        req.version = version;

        core.keep_alive = version >= (1, 1);
        core.request = Some(req);
        core.status = ConnectionStatus::ReadingRequest;
        true
    }

    fn on_message_header(
        &mut self,
        name: &[u8],
        name_span: Range<usize>,
        value: &[u8],
        value_span: Range<usize>,
    ) -> bool {
        let mut core = self.core.borrow_mut();
        let input = core.input.clone();
        let core = &mut *core;
        let Some(req) = core.request.as_mut() else {
            return false;
        };

        // Targeted fast paths, then the ordered header list.
        if name.eq_ignore_ascii_case(b"Host") {
            // The name only; the port travels separately.
            let name_end = memchr::memchr(b':', value).unwrap_or(value.len());
            req.hostname = String::from_utf8_lossy(&value[..name_end]).into_owned();
        } else if name.eq_ignore_ascii_case(b"Connection") {
            if value.eq_ignore_ascii_case(b"close") {
                core.keep_alive = false;
            } else if value.eq_ignore_ascii_case(b"keep-alive") {
                core.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case(b"Expect") {
            req.expecting_continue = value.eq_ignore_ascii_case(b"100-continue");
        }

        req.request_headers.push((
            ByteRef::new(input.clone(), name_span.start, name_span.len()),
            ByteRef::new(input, value_span.start, value_span.len()),
        ));
        true
    }

    fn on_message_header_end(&mut self) -> bool {
        self.actions.push(Action::Dispatch);
        // Pause: the driver decodes the URI and dispatches the handler
        // before any body bytes flow.
        false
    }

    fn on_message_content(&mut self, _chunk: &[u8], span: Range<usize>) -> bool {
        self.actions.push(Action::Content(span));
        true
    }

    fn on_message_end(&mut self) -> bool {
        self.actions.push(Action::End);
        // No pipelined request is parsed until this one finishes.
        false
    }
}

/// Driver for one accepted socket.
pub(crate) struct HttpConnection {
    core: Rc<RefCell<ConnCore>>,
    stream: TcpStream,
    parser: MessageParser,
    input: SharedBuffer,
    input_offset: usize,
    actions: Vec<Action>,
    pipeline: Arc<Pipeline>,
    ctx: Rc<WorkerCtx>,
    scratch: Vec<u8>,
}

impl HttpConnection {
    pub(crate) fn new(
        stream: TcpStream,
        id: u64,
        ctx: Rc<WorkerCtx>,
        pipeline: Arc<Pipeline>,
    ) -> io::Result<Self> {
        if ctx.conn_limits.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let input = Buffer::with_capacity(8 * 1024).shared();

        let core = Rc::new(RefCell::new(ConnCore {
            id,
            status: ConnectionStatus::StartingUp,
            aborted: false,
            closed: false,
            keep_alive: false,
            handling: false,
            close_after_reply: false,
            secure: false,
            request: None,
            output: CompositeSource::new(),
            output_notify: Rc::new(Notify::new()),
            input: input.clone(),
            remote,
            local,
            ctx: ctx.clone(),
        }));

        let limits = &ctx.req_limits;
        let parser = MessageParser::new(
            ParseMode::Request,
            limits.max_header_size,
            limits.max_header_count,
            limits.max_request_line,
        );

        Ok(HttpConnection {
            core,
            stream,
            parser,
            input,
            input_offset: 0,
            actions: Vec::new(),
            pipeline,
            ctx,
            scratch: vec![0u8; 16 * 1024],
        })
    }

    pub(crate) async fn run(mut self) {
        let id = self.core.borrow().id;
        tracing::debug!(connection = id, peer = %self.core.borrow().remote, "connection started");

        self.drive().await;

        let mut core = self.core.borrow_mut();
        core.closed = true;
        core.status = ConnectionStatus::StartingUp;
        drop(core);
        self.ctx.load.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(connection = id, "connection released");
    }

    async fn drive(&mut self) {
        self.core.borrow_mut().status = ConnectionStatus::ReadingRequest;

        loop {
            match self.read_message_head().await {
                HeadOutcome::Dispatched => {}
                HeadOutcome::ErrorReply => {
                    self.flush_remaining().await;
                    return;
                }
                HeadOutcome::Close => return,
            }

            if !self.serve_message().await {
                return;
            }

            if !self.resume() {
                return;
            }
        }
    }

    /// Reads and parses until the current message's handler has been
    /// dispatched (or the connection is done).
    async fn read_message_head(&mut self) -> HeadOutcome {
        loop {
            match self.feed_parser() {
                Ok(()) => {}
                Err(kind) => return self.error_reply(kind),
            }
            if let Some(outcome) = self.process_actions() {
                return outcome;
            }
            if self.core.borrow().handling {
                return HeadOutcome::Dispatched;
            }

            let keep_alive_phase =
                self.core.borrow().status == ConnectionStatus::KeepAliveRead;
            let wait = if keep_alive_phase {
                self.ctx.conn_limits.max_keep_alive
            } else {
                self.ctx.conn_limits.max_read_idle
            };

            match timeout(wait, self.stream.read(&mut self.scratch)).await {
                Err(_elapsed) => {
                    if keep_alive_phase {
                        tracing::debug!("keep-alive idle timeout, closing");
                        return HeadOutcome::Close;
                    }
                    return self.error_reply(ErrorKind::ReadTimeout);
                }
                Ok(Ok(0)) => return HeadOutcome::Close,
                Ok(Ok(n)) => {
                    let scratch = &self.scratch[..n];
                    self.input.borrow_mut().append(scratch);
                    let mut core = self.core.borrow_mut();
                    if core.status == ConnectionStatus::KeepAliveRead {
                        core.status = ConnectionStatus::ReadingRequest;
                    }
                }
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "read failed");
                    self.abort();
                    return HeadOutcome::Close;
                }
            }
        }
    }

    /// Drives body delivery and output drain until the response is
    /// finished and fully on the wire. Returns `false` when the
    /// connection must close.
    async fn serve_message(&mut self) -> bool {
        if self.ctx.conn_limits.tcp_cork {
            if let Sink::Socket(sock) = Sink::socket(&mut self.stream) {
                sock.set_cork(true);
            }
        }

        let result = loop {
            match self.feed_parser() {
                Ok(()) => {}
                Err(kind) => {
                    // Headers may already be on the wire; a status rewrite
                    // is impossible then, so abort.
                    let headers_sent = self
                        .core
                        .borrow()
                        .request
                        .as_ref()
                        .is_some_and(|r| r.output_state != OutputState::Unhandled);
                    if headers_sent {
                        self.abort();
                        break false;
                    }
                    self.error_reply(kind);
                    self.flush_remaining().await;
                    break false;
                }
            }
            self.process_actions();

            if !self.drain_output().await {
                self.abort();
                break false;
            }
            if !self.core.borrow().output.is_empty() {
                // More queued than one burst moves; keep draining before
                // waiting on new events.
                continue;
            }

            {
                let core = self.core.borrow();
                if core.aborted {
                    drop(core);
                    break false;
                }
                let finished = core
                    .request
                    .as_ref()
                    .is_some_and(|r| r.output_state == OutputState::Finished);
                if finished && core.output.is_empty() && self.parser.message_complete() {
                    break true;
                }
            }

            let notify = self.core.borrow().output_notify.clone();
            tokio::select! {
                biased;
                _ = notify.notified() => {}
                read = self.stream.read(&mut self.scratch) => match read {
                    Ok(0) => {
                        self.abort();
                        break false;
                    }
                    Ok(n) => {
                        let scratch = &self.scratch[..n];
                        self.input.borrow_mut().append(scratch);
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "read failed mid-reply");
                        self.abort();
                        break false;
                    }
                },
            }
        };

        if self.ctx.conn_limits.tcp_cork {
            if let Sink::Socket(sock) = Sink::socket(&mut self.stream) {
                sock.set_cork(false);
            }
        }
        result
    }

    /// Keep-alive transition: release the request in place and either
    /// reparse pipelined bytes or wait for the next request.
    fn resume(&mut self) -> bool {
        let mut core = self.core.borrow_mut();
        if core.close_after_reply || !core.keep_alive || core.aborted {
            return false;
        }

        let req = core.request.take();
        core.handling = false;
        drop(req);

        self.parser.reset();

        let mut input = self.input.borrow_mut();
        if self.input_offset >= input.len() {
            input.clear();
            self.input_offset = 0;
            core.status = ConnectionStatus::KeepAliveRead;
        } else {
            core.status = ConnectionStatus::ReadingRequest;
        }
        true
    }

    // Also called with no new bytes: the parser may still owe events that
    // need no input (end-of-message after a paused header dispatch).
    fn feed_parser(&mut self) -> Result<(), ErrorKind> {
        let mut input = self.input.borrow_mut();
        let mut events = Events {
            core: &self.core,
            actions: &mut self.actions,
        };
        match self
            .parser
            .parse(input.as_mut_slice(), self.input_offset, &mut events)
        {
            Ok(consumed) => {
                self.input_offset += consumed;
                Ok(())
            }
            Err(ParseError::BadMessage) => Err(ErrorKind::BadRequest),
            Err(ParseError::HeaderLimit) => Err(ErrorKind::HeaderLimit),
        }
    }

    /// Runs deferred parser actions with no borrows held, so handler and
    /// body callbacks may reenter the connection.
    fn process_actions(&mut self) -> Option<HeadOutcome> {
        for action in std::mem::take(&mut self.actions) {
            match action {
                Action::Dispatch => {
                    if let Some(outcome) = self.dispatch() {
                        return Some(outcome);
                    }
                }
                Action::Content(span) => self.deliver_body(Some(span)),
                Action::End => self.deliver_body(None),
            }
        }
        None
    }

    /// Header-complete: decode the URI, enforce the strict checks, then
    /// hand the request to the handler pipeline.
    fn dispatch(&mut self) -> Option<HeadOutcome> {
        if let Err(kind) = self.prepare_request() {
            return Some(self.error_reply(kind));
        }

        {
            let mut guard = self.core.borrow_mut();
            let core = &mut *guard;
            let req = core.request.as_mut()?;
            req.content_length = self.parser.content_length();
            req.chunked_body = self.parser.is_chunked();

            if req.expecting_continue {
                core.output.push_back(Source::Buffer(BufferSource::new(
                    b"HTTP/1.1 100 Continue\r\n\r\n".to_vec(),
                )));
                core.notify();
            }

            core.status = ConnectionStatus::SendingReply;
            core.handling = true;
        }
        self.ctx.requests_served.set(self.ctx.requests_served.get() + 1);

        let request = Request::new(self.core.clone());
        tracing::debug!(
            connection = request.connection_id(),
            method = %request.method().to_string_lossy(),
            uri = %request.uri().to_string_lossy(),
            "dispatching request"
        );

        if !self.pipeline.dispatch(&request) {
            request.finish();
        }
        None
    }

    /// URL-decodes the URI in place, splits path and query, and applies
    /// the strict header checks.
    fn prepare_request(&mut self) -> Result<(), ErrorKind> {
        let mut guard = self.core.borrow_mut();
        let core = &mut *guard;
        let req = core.request.as_mut().ok_or(ErrorKind::BadRequest)?;

        if !matches!(req.version, (1, 0) | (1, 1)) {
            return Err(ErrorKind::UnsupportedVersion);
        }

        // Strict checks, in order: missing length (411), unexpected body
        // (400), then the expectation (417).
        let method_is_upload = {
            let m = req.method.bytes();
            *m == *b"POST" || *m == *b"PUT"
        };
        let has_body = self.parser.has_body();
        if method_is_upload && !has_body && self.parser.content_length().is_none() {
            return Err(ErrorKind::LengthRequired);
        }
        if !method_is_upload && has_body {
            return Err(ErrorKind::BadRequest);
        }

        // Expect: anything but `100-continue` from an HTTP/1.1 client
        // fails the expectation.
        if let Some(expect) = req.request_header(b"Expect") {
            let valid = req.supports_protocol(1, 1)
                && expect.eq_ignore_case(b"100-continue");
            if !valid {
                return Err(ErrorKind::ExpectationFailed);
            }
        }

        // In-place URL decode of the request target. The write cursor
        // never outruns the read cursor, so refs into the decoded region
        // stay valid.
        let uri_offset = req.uri.offset();
        let uri_len = req.uri.len();
        let mut input = core.input.borrow_mut();
        let decoded_len = url_decode(&mut input.as_mut_slice()[uri_offset..uri_offset + uri_len])
            .ok_or(ErrorKind::BadRequest)?;

        let input_handle = core.input.clone();
        req.uri = ByteRef::new(input_handle.clone(), uri_offset, decoded_len);

        let query_split = input.as_slice()[uri_offset..uri_offset + decoded_len]
            .iter()
            .position(|&b| b == b'?');
        match query_split {
            Some(at) => {
                req.path = ByteRef::new(input_handle.clone(), uri_offset, at);
                req.query = ByteRef::new(
                    input_handle,
                    uri_offset + at + 1,
                    decoded_len - at - 1,
                );
            }
            None => {
                req.path = ByteRef::new(input_handle.clone(), uri_offset, decoded_len);
                req.query = ByteRef::new(input_handle, uri_offset + decoded_len, 0);
            }
        }

        let path = &input.as_slice()[uri_offset..uri_offset + req.path.len()];
        if path.is_empty() || path[0] != b'/' || contains_dotdot(path) {
            return Err(ErrorKind::BadRequest);
        }
        Ok(())
    }

    /// Hands one body chunk (or the end-of-body sentinel) to the request's
    /// body callback.
    fn deliver_body(&mut self, span: Option<Range<usize>>) {
        let callback = {
            let mut core = self.core.borrow_mut();
            if core.aborted {
                return;
            }
            core.request.as_mut().and_then(|r| r.body_callback.take())
        };
        let Some(mut callback) = callback else {
            return;
        };

        let chunk = match &span {
            Some(span) => {
                let input = self.core.borrow().input.clone();
                ByteRef::new(input, span.start, span.len())
            }
            None => ByteRef::empty(),
        };
        callback(chunk);

        let mut core = self.core.borrow_mut();
        if let Some(req) = core.request.as_mut() {
            if req.body_callback.is_none() {
                req.body_callback = Some(callback);
            }
        }
    }

    /// Queues a canned error response and closes after it drains. If the
    /// response headers already went out, this is an abort instead.
    fn error_reply(&mut self, kind: ErrorKind) -> HeadOutcome {
        tracing::debug!(error = %kind, "request failed before handler");
        let mut guard = self.core.borrow_mut();
        let core = &mut *guard;
        if core.aborted {
            return HeadOutcome::Close;
        }

        if let Some(req) = core.request.as_mut() {
            if req.output_state != OutputState::Unhandled {
                drop(guard);
                self.abort();
                return HeadOutcome::Close;
            }
            req.output_state = OutputState::Finished;
        }

        core.output
            .push_back(Source::Buffer(BufferSource::new(kind.as_http().to_vec())));
        core.close_after_reply = true;
        core.handling = false;
        HeadOutcome::ErrorReply
    }

    /// Pushes queued output to the socket, a bounded burst per call.
    /// Returns `false` on write timeout or error.
    async fn drain_output(&mut self) -> bool {
        let mut queue = {
            let mut core = self.core.borrow_mut();
            if core.output.is_empty() {
                return true;
            }
            std::mem::take(&mut core.output)
        };

        let write_idle = self.ctx.conn_limits.max_write_idle;
        let mut healthy = true;

        for _ in 0..DRAIN_BURST {
            let mut sink = Sink::socket(&mut self.stream);
            let mut source = Source::Composite(std::mem::take(&mut queue));
            let sent = match timeout(write_idle, source.sendto(&mut sink)).await {
                Err(_elapsed) => {
                    tracing::debug!("write idle timeout");
                    healthy = false;
                    0
                }
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "write failed");
                    healthy = false;
                    0
                }
                Ok(Ok(sent)) => sent,
            };
            let Source::Composite(q) = source else {
                unreachable!()
            };
            queue = q;

            if sent == 0 {
                break;
            }
            let mut core = self.core.borrow_mut();
            if let Some(req) = core.request.as_mut() {
                req.bytes_transmitted += sent as u64;
            }
        }

        // Anything enqueued by callbacks during the drain comes after the
        // bytes still waiting in `queue`.
        let mut core = self.core.borrow_mut();
        if !queue.is_empty() {
            let appended = std::mem::replace(&mut core.output, queue);
            // `appended` holds sources enqueued mid-drain.
            let mut tail = appended;
            while let Some(src) = tail.pop_front() {
                core.output.push_back(src);
            }
        }
        healthy
    }

    /// Flushes a queued error page, then lets the caller close.
    async fn flush_remaining(&mut self) {
        loop {
            if !self.drain_output().await {
                return;
            }
            if self.core.borrow().output.is_empty() {
                return;
            }
        }
    }

    /// Idempotent: discards pending output, fires the abort handler once,
    /// and marks the connection closed.
    fn abort(&mut self) {
        let handler = {
            let mut core = self.core.borrow_mut();
            if core.aborted {
                return;
            }
            core.aborted = true;
            core.closed = true;
            core.output.clear();
            core.request.as_mut().and_then(|r| r.abort_handler.take())
        };
        tracing::debug!("connection aborted");
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[derive(Debug, PartialEq)]
enum HeadOutcome {
    Dispatched,
    ErrorReply,
    Close,
}

/// Decodes `%XX` escapes and `+` in place; returns the decoded length.
/// Idempotent on inputs free of `%` and `+`.
fn url_decode(bytes: &mut [u8]) -> Option<usize> {
    let mut write = 0;
    let mut read = 0;
    while read < bytes.len() {
        match bytes[read] {
            b'%' => {
                if read + 2 >= bytes.len() {
                    return None;
                }
                let hi = hex_digit(bytes[read + 1])?;
                let lo = hex_digit(bytes[read + 2])?;
                bytes[write] = (hi << 4) | lo;
                read += 3;
            }
            b'+' => {
                bytes[write] = b' ';
                read += 1;
            }
            b => {
                bytes[write] = b;
                read += 1;
            }
        }
        write += 1;
    }
    Some(write)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn contains_dotdot(path: &[u8]) -> bool {
    path.windows(2).any(|w| w == b"..")
}

//! Server configuration limits and timeouts.
//!
//! Defaults are conservative: they bound header flooding, slow-read and
//! slow-write peers, and accept-queue growth before any request reaches a
//! handler.

use std::time::Duration;

/// Server-level concurrency and admission tunables.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker threads, each running its own event loop
    /// (default: `4`). Every connection is pinned to one worker for its
    /// whole life.
    pub workers: usize,

    /// Maximum number of accepted sockets waiting in worker intake queues
    /// (default: `250`). Beyond this, new connections receive an immediate
    /// 503 and are closed.
    pub max_pending_connections: usize,

    /// How worker threads wait when their intake queue is empty
    /// (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: 4,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            _priv: (),
        }
    }
}

/// Worker intake polling behavior when no connections are queued.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// `tokio::task::yield_now()` between polls. Lowest latency, busy CPU.
    Yield,
    /// `tokio::time::sleep(..)` between polls.
    Sleep(Duration),
}

/// Per-connection I/O timeouts and TCP options.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum idle time while reading a request (default: `60s`).
    /// Expiry answers 408 and closes.
    pub max_read_idle: Duration,

    /// Maximum idle time with response output pending (default: `360s`).
    /// Expiry aborts the connection; no partial status rewrite is possible.
    pub max_write_idle: Duration,

    /// Maximum idle time between keep-alive requests (default: `60s`).
    /// Expiry closes silently.
    pub max_keep_alive: Duration,

    /// Sets `TCP_NODELAY` on accepted sockets (default: `true`).
    pub tcp_nodelay: bool,

    /// Sets `TCP_DEFER_ACCEPT` on the listening socket where the OS
    /// supports it (default: `true`).
    pub tcp_defer_accept: bool,

    /// Batches response header and body segments with `TCP_CORK` where the
    /// OS supports it; the cork is cleared before keep-alive resume
    /// (default: `true`).
    pub tcp_cork: bool,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            max_read_idle: Duration::from_secs(60),
            max_write_idle: Duration::from_secs(360),
            max_keep_alive: Duration::from_secs(60),
            tcp_nodelay: true,
            tcp_defer_accept: true,
            tcp_cork: true,
            _priv: (),
        }
    }
}

/// Request parsing limits.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of a single header line, name plus value
    /// (default: `8192`). Exceeding it answers 413.
    pub max_header_size: usize,

    /// Maximum number of request headers (default: `128`).
    /// Exceeding it answers 413.
    pub max_header_count: usize,

    /// Maximum size of the request line (default: `8192`).
    pub max_request_line: usize,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_header_size: 8192,
            max_header_count: 128,
            max_request_line: 8192,
            _priv: (),
        }
    }
}

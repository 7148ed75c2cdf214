//! Worker threads: one single-threaded event loop each.
//!
//! Every worker owns a disjoint set of connections; a connection, its
//! request, and any FastCGI transport it spawns live and die on the
//! worker's thread. Intake is a lock-free queue fed by the listener,
//! polled with the configured wait strategy.

use crate::http::response::DateCache;
use crate::limits::{ConnLimits, ReqLimits, WaitStrategy};
use crate::server::connection::HttpConnection;
use crate::server::server::Pipeline;
use crossbeam::queue::SegQueue;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::yield_now;
use tokio::time::sleep;

/// Worker-wide state shared with every connection pinned to it.
pub(crate) struct WorkerCtx {
    pub(crate) worker_id: usize,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) date: DateCache,
    pub(crate) requests_served: Cell<u64>,
    pub(crate) load: Arc<AtomicUsize>,
}

/// The listener's view of one worker: where to enqueue sockets and how
/// loaded it currently is (queued plus live connections).
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub(crate) intake: Arc<SegQueue<std::net::TcpStream>>,
    pub(crate) load: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub(crate) fn queued(&self) -> usize {
        self.intake.len()
    }
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) handle: WorkerHandle,
}

impl Worker {
    pub(crate) fn new(id: usize) -> Self {
        Worker {
            id,
            handle: WorkerHandle {
                intake: Arc::new(SegQueue::new()),
                load: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Starts the worker thread: a current-thread runtime plus a local
    /// task set, looping on intake forever.
    pub(crate) fn spawn(
        self,
        conn_limits: ConnLimits,
        req_limits: ReqLimits,
        wait_strategy: WaitStrategy,
        pipeline: Arc<Pipeline>,
        connection_ids: Arc<AtomicU64>,
    ) -> std::thread::JoinHandle<()> {
        let Worker { id, handle } = self;

        std::thread::Builder::new()
            .name(format!("origin-worker-{id}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("worker runtime");
                let local = tokio::task::LocalSet::new();

                let ctx = Rc::new(WorkerCtx {
                    worker_id: id,
                    conn_limits,
                    req_limits,
                    date: DateCache::new(),
                    requests_served: Cell::new(0),
                    load: handle.load.clone(),
                });

                local.block_on(&runtime, Self::intake_loop(
                    handle,
                    ctx,
                    wait_strategy,
                    pipeline,
                    connection_ids,
                ));
            })
            .expect("worker thread")
    }

    async fn intake_loop(
        handle: WorkerHandle,
        ctx: Rc<WorkerCtx>,
        wait_strategy: WaitStrategy,
        pipeline: Arc<Pipeline>,
        connection_ids: Arc<AtomicU64>,
    ) {
        loop {
            let Some(stream) = handle.intake.pop() else {
                match wait_strategy {
                    WaitStrategy::Yield => yield_now().await,
                    WaitStrategy::Sleep(pause) => sleep(pause).await,
                }
                continue;
            };

            let id = connection_ids.fetch_add(1, Ordering::Relaxed);
            let accepted = stream
                .set_nonblocking(true)
                .and_then(|()| tokio::net::TcpStream::from_std(stream));

            match accepted {
                Ok(stream) => {
                    match HttpConnection::new(stream, id, ctx.clone(), pipeline.clone()) {
                        Ok(connection) => {
                            tokio::task::spawn_local(connection.run());
                        }
                        Err(err) => {
                            tracing::warn!(worker = ctx.worker_id, error = %err, "connection setup failed");
                            handle.load.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(worker = ctx.worker_id, error = %err, "socket adoption failed");
                    handle.load.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }
}

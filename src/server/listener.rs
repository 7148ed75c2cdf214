//! Accept loop: hands each accepted socket to the least-loaded worker.

use crate::errors::ErrorKind;
use crate::limits::ServerLimits;
use crate::server::worker::WorkerHandle;
use std::sync::atomic::Ordering;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Enables `TCP_DEFER_ACCEPT` so sockets surface only once request bytes
/// arrive. No-op where the OS lacks it.
pub(crate) fn set_defer_accept(listener: &TcpListener) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        let seconds: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                listener.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                &seconds as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = listener;
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    limits: ServerLimits,
) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            continue;
        };

        let queued: usize = workers.iter().map(WorkerHandle::queued).sum();
        if queued >= limits.max_pending_connections {
            tracing::warn!(%peer, queued, "intake queues full, shedding connection");
            shed(stream);
            continue;
        }

        // Round-robin by connection count: the least-loaded worker wins.
        let target = workers
            .iter()
            .min_by_key(|w| w.load.load(Ordering::Relaxed))
            .expect("at least one worker");

        match stream.into_std() {
            Ok(stream) => {
                target.load.fetch_add(1, Ordering::Relaxed);
                target.intake.push(stream);
            }
            Err(err) => tracing::warn!(error = %err, "failed to detach accepted socket"),
        }
    }
}

/// Answers 503 and closes, without involving a worker.
fn shed(mut stream: TcpStream) {
    tokio::spawn(async move {
        let _ = stream.write_all(ErrorKind::ServiceUnavailable.as_http()).await;
        let _ = stream.shutdown().await;
    });
}

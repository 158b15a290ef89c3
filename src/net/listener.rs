use crate::error::BackplaneError;
use crate::limiter::{ConcurrencyLimiter, EmaRateLimiter, LimiterGuard};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);
const DEFAULT_MAX_CONN_RATE: f64 = 999_999.0;

/// TCP listener wrapped with connection-rate admission, a concurrency cap,
/// and cooperative shutdown.
pub struct StoppableListener {
    inner: TcpListener,
    rate_limiter: EmaRateLimiter,
    concurrency: ConcurrencyLimiter,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    stop_ack: Notify,
    accepted_count: AtomicI64,
    active_count: Arc<AtomicI64>,
}

/// Releases the concurrency slot and decrements the active-connection
/// counter exactly once when dropped. Kept separate from the stream itself
/// so callers can move `AcceptedStream::stream` out (e.g. into a TLS
/// acceptor) while this guard keeps tracking the connection's lifetime.
pub struct ConnGuard {
    _guard: LimiterGuard,
    active_count: Arc<AtomicI64>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An accepted connection paired with its lifetime guard.
pub struct AcceptedStream {
    pub stream: TcpStream,
    pub peer_addr: std::net::SocketAddr,
    pub guard: ConnGuard,
}

impl StoppableListener {
    pub fn new(
        inner: TcpListener,
        max_conn_rate: Option<f64>,
        max_conns: usize,
    ) -> Self {
        Self {
            inner,
            rate_limiter: EmaRateLimiter::new(max_conn_rate.unwrap_or(DEFAULT_MAX_CONN_RATE)),
            concurrency: ConcurrencyLimiter::new(max_conns),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            stop_ack: Notify::new(),
            accepted_count: AtomicI64::new(0),
            active_count: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn active_count(&self) -> i64 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn accepted_count(&self) -> i64 {
        self.accepted_count.load(Ordering::SeqCst)
    }

    /// Accept the next connection, bounded by the concurrency cap and
    /// the connection-rate admission controller.
    pub async fn accept(&self) -> Result<AcceptedStream, BackplaneError> {
        let guard = self.concurrency.acquire().await;

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.stop_ack.notify_waiters();
                return Err(BackplaneError::Stopped);
            }

            let accept_fut = self.inner.accept();
            match tokio::time::timeout(ACCEPT_DEADLINE, accept_fut).await {
                Err(_elapsed) => continue, // accept deadline hit; re-check stop signal
                Ok(Err(_io_err)) => continue, // transient accept error, keep trying
                Ok(Ok((stream, peer))) => {
                    if !self.rate_limiter.accept() {
                        drop(stream);
                        continue;
                    }

                    self.accepted_count.fetch_add(1, Ordering::SeqCst);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    let _ = stream.set_nodelay(true);
                    if let Ok(sock_ref) = socket2_keepalive(&stream) {
                        let _ = sock_ref;
                    }

                    return Ok(AcceptedStream {
                        stream,
                        peer_addr: peer,
                        guard: ConnGuard {
                            _guard: guard,
                            active_count: self.active_count.clone(),
                        },
                    });
                }
            }
        }
    }

    /// Signal the accept loop to stop. If `wait` is true, blocks until the
    /// loop has acknowledged (observed the signal inside `accept()`).
    pub async fn stop(&self, wait: bool) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if wait {
            // The accept loop notifies on its next deadline tick or accept
            // attempt; register interest before notifying to avoid missing
            // a notification that fires between the store above and here.
            let notified = self.stop_ack.notified();
            self.stop_notify.notify_waiters();
            notified.await;
        } else {
            self.stop_notify.notify_waiters();
        }
    }
}

/// Enables TCP keep-alive with a 3 minute period. `tokio::net::TcpStream`
/// does not expose a keepalive-period setter directly; the underlying fd
/// is configured through `socket2`.
fn socket2_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use socket2::{SockRef, TcpKeepalive};
    let sock_ref = SockRef::from(stream);
    let ka = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    sock_ref.set_tcp_keepalive(&ka)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_accepted_sockets_never_exceed_the_cap() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sln = Arc::new(StoppableListener::new(listener, None, 2));

        // Fire off more concurrent dial attempts than the cap.
        for _ in 0..2 {
            tokio::spawn(async move {
                let _ = tokio::net::TcpStream::connect(addr).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let s1 = sln.accept().await.unwrap();
        let s2 = sln.accept().await.unwrap();
        assert_eq!(sln.active_count(), 2);
        drop(s1);
        drop(s2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sln.active_count(), 0);
    }

    #[tokio::test]
    async fn stop_wait_true_blocks_until_acknowledged_then_accept_errs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sln = Arc::new(StoppableListener::new(listener, None, 4));

        let sln2 = sln.clone();
        let accept_task = tokio::spawn(async move { sln2.accept().await });

        // Give the accept loop a moment to enter its deadline loop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sln.stop(true).await;

        let result = accept_task.await.unwrap();
        assert!(matches!(result, Err(BackplaneError::Stopped)));
    }
}

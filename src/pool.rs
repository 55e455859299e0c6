//! Per-target pool of idle upstream connections.

use crate::connection::{BoxedIo, PooledConnection};
use crate::error::ProxyError;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, trace};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

pub type DialFuture = Pin<Box<dyn Future<Output = Result<BoxedIo, ProxyError>> + Send>>;

/// Opens a fresh connection to the pool's target.
pub type DialFn = Arc<dyn Fn() -> DialFuture + Send + Sync>;

pub const DEFAULT_MAX_RESPONSE_HEADER_BYTES: usize = 64 * 1024;

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub dials: u64,
    pub dial_failures: u64,
    pub reused: u64,
    /// Connections closed on release because the idle buffer was full.
    pub closed_full: u64,
    pub evicted: u64,
    pub idle: usize,
}

#[derive(Default)]
struct Counters {
    dials: AtomicU64,
    dial_failures: AtomicU64,
    reused: AtomicU64,
    closed_full: AtomicU64,
    evicted: AtomicU64,
}

pub(crate) struct PoolShared {
    target: String,
    idle_tx: Sender<PooledConnection>,
    idle_rx: Receiver<PooledConnection>,
    available: Notify,
    dial: DialFn,
    idle_timeout: Duration,
    max_idle: usize,
    max_header_bytes: usize,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
}

impl PoolShared {
    /// Takes an idle connection, closing any stale ones found on the way.
    fn try_take(&self) -> Option<PooledConnection> {
        let now = Instant::now();
        while let Ok(conn) = self.idle_rx.try_recv() {
            if conn.is_stale(now) {
                trace!("{}: dropping stale connection {}", self.target, conn.id());
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Some(conn);
        }
        None
    }

    async fn wait_idle(&self) -> PooledConnection {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(conn) = self.try_take() {
                return conn;
            }
            notified.await;
        }
    }

    async fn dial_new(self: &Arc<Self>) -> Result<PooledConnection, ProxyError> {
        self.counters.dials.fetch_add(1, Ordering::Relaxed);
        match (self.dial)().await {
            Ok(io) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                trace!("{}: dialed connection {}", self.target, id);
                Ok(PooledConnection::spawn(
                    id,
                    io,
                    self.idle_timeout,
                    Arc::downgrade(self),
                    self.max_header_bytes,
                ))
            }
            Err(e) => {
                self.counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                debug!("{}: dial failed: {}", self.target, e);
                Err(e)
            }
        }
    }

    /// Parks `conn` for reuse, or closes it when the pool is full or closed.
    pub(crate) fn release(&self, mut conn: PooledConnection) {
        conn.idle_since = Instant::now();
        if self.max_idle == 0 || self.closed.load(Ordering::Acquire) {
            self.counters.closed_full.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.enqueue(conn);
    }

    /// Pushes onto the idle queue; a full queue closes the connection.
    fn enqueue(&self, conn: PooledConnection) {
        match self.idle_tx.try_send(conn) {
            Ok(()) => self.available.notify_one(),
            Err(TrySendError::Full(conn)) => {
                trace!("{}: idle buffer full, closing connection {}", self.target, conn.id());
                self.counters.closed_full.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Closes expired or broken connections at the head of the idle queue.
    /// Stops at the first live one, which goes back in the queue.
    fn evict_expired(&self) {
        let now = Instant::now();
        while let Ok(conn) = self.idle_rx.try_recv() {
            if conn.is_stale(now) {
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            // Concurrent releases may have refilled the queue meanwhile.
            self.enqueue(conn);
            break;
        }
    }

    fn drain(&self) {
        while self.idle_rx.try_recv().is_ok() {}
    }
}

/// Idle connections for one target, bounded by `max_idle`.
///
/// Acquiring races the idle queue against a fresh dial; a dial that loses the
/// race is parked in the pool when it completes rather than thrown away.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    eviction: CancellationToken,
}

impl ConnectionPool {
    /// Must be called from within a tokio runtime when `idle_timeout` is
    /// non-zero: the eviction task is spawned here.
    pub fn new(target: impl Into<String>, dial: DialFn, max_idle: usize, idle_timeout: Duration) -> Self {
        Self::with_max_header_bytes(target, dial, max_idle, idle_timeout, DEFAULT_MAX_RESPONSE_HEADER_BYTES)
    }

    pub fn with_max_header_bytes(
        target: impl Into<String>,
        dial: DialFn,
        max_idle: usize,
        idle_timeout: Duration,
        max_header_bytes: usize,
    ) -> Self {
        let (idle_tx, idle_rx) = crossbeam_channel::bounded(max_idle.max(1));
        let shared = Arc::new(PoolShared {
            target: target.into(),
            idle_tx,
            idle_rx,
            available: Notify::new(),
            dial,
            idle_timeout,
            max_idle,
            max_header_bytes,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        });

        let eviction = CancellationToken::new();
        if !idle_timeout.is_zero() {
            spawn_eviction(Arc::downgrade(&shared), idle_timeout / 2, eviction.clone());
        }

        Self { shared, eviction }
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Stale idle connections are closed by `try_take`. A fresh dial is handed
    /// out as is, so an upstream that hangs up right away fails the request
    /// instead of being redialed in a loop.
    pub async fn acquire_conn(&self) -> Result<PooledConnection, ProxyError> {
        match self.shared.try_take() {
            Some(conn) => Ok(conn),
            None => self.race_dial().await,
        }
    }

    async fn race_dial(&self) -> Result<PooledConnection, ProxyError> {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = shared.dial_new().await;
            if let Err(Ok(conn)) = tx.send(result) {
                // The acquirer took an idle connection or went away.
                shared.release(conn);
            }
        });

        tokio::select! {
            conn = self.shared.wait_idle() => Ok(conn),
            result = rx => match result {
                Ok(result) => result,
                Err(_) => Err(ProxyError::dial(
                    self.shared.target.clone(),
                    io::Error::other("dial task aborted"),
                )),
            },
        }
    }

    pub fn release_conn(&self, conn: PooledConnection) {
        self.shared.release(conn);
    }

    /// Stops eviction and closes every idle connection. Connections released
    /// afterwards are closed instead of parked.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.eviction.cancel();
        self.shared.drain();
        debug!("{}: pool closed", self.shared.target);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            dials: c.dials.load(Ordering::Relaxed),
            dial_failures: c.dial_failures.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            closed_full: c.closed_full.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            idle: self.shared.idle_rx.len(),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_eviction(shared: Weak<PoolShared>, period: Duration, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.evict_expired();
        }
    });
}

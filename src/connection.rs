//! One upstream HTTP/1.1 connection and the task that reads its responses.
//!
//! A connection is split on creation: the writer half travels with the
//! [`PooledConnection`] handle, the reader half stays with a spawned response
//! loop. Before reading a response the loop must receive the handle back
//! through a one-shot handoff, so at most one request is in flight per
//! connection and a connection can only re-enter the pool once its previous
//! response has been fully read.

use crate::body::UpstreamBody;
use crate::error::ProxyError;
use crate::pool::PoolShared;
use crate::upgrade;
use crate::wire::{self, BodyLength, BodyOutcome, ResponseHead};
use bytes::BytesMut;
use hyper::header::{HeaderName, CONNECTION, TRANSFER_ENCODING};
use hyper::{Method, Response, StatusCode, Version};
use log::{debug, trace};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

/// Any byte stream the dialer can hand back: plain TCP, TLS, or a proxy tunnel.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxedIo = Box<dyn Io>;

const BODY_CHANNEL_CAPACITY: usize = 16;
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

pub struct PooledConnection {
    id: u64,
    writer: WriteHalf<BoxedIo>,
    handoff: Option<oneshot::Sender<Handoff>>,
    pub(crate) idle_since: Instant,
    idle_timeout: Duration,
    /// Set by the response loop when the upstream closes or talks out of turn.
    broken: Arc<AtomicBool>,
}

/// What the response loop hands back for one request.
pub(crate) enum Upstream {
    Response(Response<UpstreamBody>),
    /// The upstream accepted the protocol switch; the raw stream is ours now.
    Switching {
        head: ResponseHead,
        backend: BackendStream,
    },
}

/// Upstream side of a switched connection.
pub struct BackendStream {
    pub reader: ReadHalf<BoxedIo>,
    /// Bytes the upstream sent right after the 101 head.
    pub buffered: BytesMut,
    pub writer: WriteHalf<BoxedIo>,
}

pub(crate) struct Handoff {
    conn: PooledConnection,
    respond: oneshot::Sender<Result<Upstream, ProxyError>>,
    method: Method,
    /// Protocol the caller asked to switch to, if any.
    upgrade: Option<String>,
}

impl PooledConnection {
    pub(crate) fn spawn(
        id: u64,
        io: BoxedIo,
        idle_timeout: Duration,
        pool: Weak<PoolShared>,
        max_header_bytes: usize,
    ) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let broken = Arc::new(AtomicBool::new(false));
        tokio::spawn(response_loop(
            id,
            reader,
            handoff_rx,
            Arc::clone(&broken),
            pool,
            max_header_bytes,
        ));

        Self {
            id,
            writer,
            handoff: Some(handoff_tx),
            idle_since: Instant::now(),
            idle_timeout,
            broken,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn writer(&mut self) -> &mut WriteHalf<BoxedIo> {
        &mut self.writer
    }

    /// Zero idle timeout means the connection never expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.idle_timeout.is_zero() && now.saturating_duration_since(self.idle_since) > self.idle_timeout
    }

    /// The upstream closed the connection, failed it, or sent bytes nobody asked for.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Expired or broken: close it instead of handing it out.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.is_broken() || self.is_expired(now)
    }

    /// Passes the connection to its response loop once the request is on the wire.
    pub(crate) fn await_response(
        mut self,
        method: Method,
        upgrade: Option<String>,
    ) -> Result<oneshot::Receiver<Result<Upstream, ProxyError>>, ProxyError> {
        let gone = || ProxyError::RoundTrip(io::Error::new(io::ErrorKind::BrokenPipe, "connection reader exited"));
        let handoff = self.handoff.take().ok_or_else(gone)?;
        let (respond, rx) = oneshot::channel();
        handoff
            .send(Handoff {
                conn: self,
                respond,
                method,
                upgrade,
            })
            .map_err(|_| gone())?;
        Ok(rx)
    }
}

async fn read_final_head(
    reader: &mut ReadHalf<BoxedIo>,
    buf: &mut BytesMut,
    max_header_bytes: usize,
) -> io::Result<ResponseHead> {
    loop {
        let head = wire::read_response_head(reader, buf, max_header_bytes).await?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            trace!("skipping interim {} response", head.status);
            continue;
        }
        return Ok(head);
    }
}

fn into_response(mut head: ResponseHead, body: UpstreamBody) -> Response<UpstreamBody> {
    let named: Vec<HeaderName> = head
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        head.headers.remove(name);
    }
    for name in [CONNECTION, TRANSFER_ENCODING] {
        head.headers.remove(name);
    }
    head.headers.remove("keep-alive");
    head.headers.remove("proxy-connection");

    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.version_mut() = Version::HTTP_11;
    *response.headers_mut() = head.headers;
    response
}

/// Waits for the next request while watching the socket.
///
/// Anything the upstream does between requests marks the connection broken
/// so the pool drops it. Bytes read here stay in `buf`: a request may already
/// be on the wire with its handoff not yet sent, and then they are the start
/// of its response. Returns `None` once the handle is dropped.
async fn await_handoff(
    id: u64,
    reader: &mut ReadHalf<BoxedIo>,
    buf: &mut BytesMut,
    handoff_rx: &mut oneshot::Receiver<Handoff>,
    broken: &AtomicBool,
) -> Option<Handoff> {
    let mut closed = false;
    let mut watching = true;
    loop {
        if !watching {
            return handoff_rx.await.ok();
        }
        tokio::select! {
            handoff = &mut *handoff_rx => {
                let handoff = handoff.ok()?;
                if !closed {
                    broken.store(false, Ordering::Release);
                }
                return Some(handoff);
            }
            read = reader.read_buf(buf) => {
                broken.store(true, Ordering::Release);
                watching = false;
                match read {
                    Ok(0) => {
                        trace!("connection {}: upstream closed while idle", id);
                        closed = true;
                    }
                    Ok(n) => trace!("connection {}: {} bytes arrived while idle", id, n),
                    Err(e) => {
                        trace!("connection {}: read failed while idle: {}", id, e);
                        closed = true;
                    }
                }
            }
        }
    }
}

async fn response_loop(
    id: u64,
    mut reader: ReadHalf<BoxedIo>,
    mut handoff_rx: oneshot::Receiver<Handoff>,
    broken: Arc<AtomicBool>,
    pool: Weak<PoolShared>,
    max_header_bytes: usize,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    loop {
        let Some(handoff) = await_handoff(id, &mut reader, &mut buf, &mut handoff_rx, &broken).await else {
            trace!("connection {} closed", id);
            return;
        };
        let Handoff {
            mut conn,
            mut respond,
            method,
            upgrade,
        } = handoff;

        let head = tokio::select! {
            head = read_final_head(&mut reader, &mut buf, max_header_bytes) => head,
            _ = respond.closed() => {
                debug!("connection {}: caller left before the response head", id);
                return;
            }
        };
        let head = match head {
            Ok(head) => head,
            Err(e) => {
                let _ = respond.send(Err(ProxyError::RoundTrip(e)));
                return;
            }
        };

        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            let result = upgrade::check_switch(upgrade.as_deref(), &head).map(|()| Upstream::Switching {
                head,
                backend: BackendStream {
                    reader,
                    buffered: buf,
                    writer: conn.writer,
                },
            });
            let _ = respond.send(result);
            return;
        }

        let length = match wire::response_body_length(&method, &head) {
            Ok(length) => length,
            Err(e) => {
                let _ = respond.send(Err(ProxyError::RoundTrip(e)));
                return;
            }
        };
        let reusable = wire::keep_alive(&head) && length != BodyLength::UntilClose;

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let response = into_response(head, UpstreamBody::new(rx, length.exact()));
        if respond.send(Ok(Upstream::Response(response))).is_err() {
            debug!("connection {}: response dropped before delivery", id);
            return;
        }

        let outcome = wire::relay_body(&mut reader, &mut buf, length, &tx).await;
        drop(tx);
        if outcome != BodyOutcome::Complete || !reusable {
            trace!("connection {} not reusable ({:?})", id, outcome);
            return;
        }
        if !buf.is_empty() {
            debug!("connection {}: {} unexpected bytes after response", id, buf.len());
            return;
        }
        if conn.is_broken() {
            trace!("connection {} closed by upstream", id);
            return;
        }

        let (next_tx, next_rx) = oneshot::channel();
        conn.handoff = Some(next_tx);
        handoff_rx = next_rx;
        match pool.upgrade() {
            Some(pool) => pool.release(conn),
            None => return,
        }
    }
}

use crate::body::{BoxError, ProxyBody, ResponseBuilder, UpstreamBody};
use crate::buffers::BufferPool;
use crate::connection::Upstream;
use crate::error::ProxyError;
use crate::outbound::{build_outbound, RewriteOptions};
use crate::pool::ConnectionPool;
use crate::upgrade::{UpgradeHandler, UpgradeResponseHeaders};
use crate::wire::{self, RequestBody, RequestFraming};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Method, Request, Response};
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const IDEMPOTENCY_HEADERS: [&str; 2] = ["idempotency-key", "x-idempotency-key"];

/// Forwards requests for one target over a shared [`ConnectionPool`].
pub struct ReverseProxy {
    pool: Arc<ConnectionPool>,
    rewrite: RewriteOptions,
    absolute_form: bool,
    response_header_timeout: Option<Duration>,
    max_replays: u32,
    buffers: Arc<BufferPool>,
}

fn request_framing(method: &Method, body: &RequestBody) -> RequestFraming {
    let exact = body.size_hint().exact();
    if body.is_end_stream() || exact == Some(0) {
        if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
            RequestFraming::Length(0)
        } else {
            RequestFraming::None
        }
    } else if let Some(length) = exact {
        RequestFraming::Length(length)
    } else {
        RequestFraming::Chunked
    }
}

fn apply_framing(headers: &mut HeaderMap, framing: RequestFraming) {
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    match framing {
        RequestFraming::None => {}
        RequestFraming::Length(length) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        RequestFraming::Chunked => {
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
    }
}

/// Safe to send again after a write that put nothing on the wire.
fn is_replayable(method: &Method, headers: &HeaderMap, body_empty: bool) -> bool {
    if IDEMPOTENCY_HEADERS.iter().any(|h| headers.contains_key(*h)) {
        return true;
    }
    body_empty && matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

impl ReverseProxy {
    pub fn new(pool: Arc<ConnectionPool>, rewrite: RewriteOptions) -> Self {
        Self {
            pool,
            rewrite,
            absolute_form: false,
            response_header_timeout: None,
            max_replays: 3,
            buffers: Arc::new(BufferPool::default()),
        }
    }

    /// Write absolute-form request targets (plain HTTP forward proxy).
    pub fn with_absolute_form(mut self, absolute_form: bool) -> Self {
        self.absolute_form = absolute_form;
        self
    }

    pub fn with_response_header_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_header_timeout = timeout;
        self
    }

    pub fn with_max_replays(mut self, max_replays: u32) -> Self {
        self.max_replays = max_replays;
        self
    }

    pub fn with_buffers(mut self, buffers: Arc<BufferPool>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn target(&self) -> &url::Url {
        &self.rewrite.target
    }

    pub async fn serve<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.serve_with_cancel(req, CancellationToken::new()).await
    }

    /// Like [`serve`](Self::serve); `cancel` firing before the response head
    /// arrives yields `499 Client Closed Request`.
    pub async fn serve_with_cancel<B>(&self, req: Request<B>, cancel: CancellationToken) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match self.process_request(req, cancel).await {
            Ok(response) => response,
            Err(e) => ResponseBuilder::from_error(&e),
        }
    }

    async fn process_request<B>(&self, mut req: Request<B>, cancel: CancellationToken) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let (parts, body) = req.into_parts();
        let mut body: RequestBody = body.map_err(Into::into).boxed_unsync();

        let mut outbound = build_outbound(&parts, &self.rewrite)?;
        let framing = request_framing(&outbound.method, &body);
        apply_framing(&mut outbound.headers, framing);
        let body_empty = framing == RequestFraming::None || framing == RequestFraming::Length(0);
        let replayable = is_replayable(&outbound.method, &parts.headers, body_empty);

        let mut head = self.buffers.get();
        wire::encode_request_head(
            &mut head,
            &outbound.method,
            &outbound.request_target(self.absolute_form),
            &outbound.headers,
            outbound.is_websocket(),
        );
        trace!(
            "{} {} -> {}",
            outbound.method,
            outbound.raw_path,
            self.pool.target()
        );

        let mut replays = 0;
        let conn = loop {
            let mut conn = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Canceled),
                conn = self.pool.acquire_conn() => conn?,
            };

            let mut written = 0;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Canceled),
                result = wire::write_request(conn.writer(), &head, &mut body, framing, &mut written) => result,
            };
            match result {
                Ok(()) => break conn,
                Err(source) => {
                    drop(conn);
                    if written > 0 || !replayable || replays >= self.max_replays {
                        return Err(ProxyError::Write { written, source });
                    }
                    replays += 1;
                    debug!(
                        "{}: write failed before any byte was sent ({}), replaying ({}/{})",
                        self.pool.target(),
                        source,
                        replays,
                        self.max_replays
                    );
                }
            }
        };
        self.buffers.put(head);

        let rx = conn.await_response(outbound.method.clone(), outbound.upgrade.clone())?;
        let upstream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Canceled),
            upstream = self.await_head(rx) => upstream?,
        };

        match upstream {
            Upstream::Response(response) => Ok(response.map(UpstreamBody::into_proxy_body)),
            Upstream::Switching { head, backend } => {
                let Some(on_upgrade) = on_upgrade else {
                    return Err(ProxyError::protocol(
                        "can't switch protocols: inbound connection does not support upgrades",
                    ));
                };
                let extra = parts.extensions.get::<UpgradeResponseHeaders>().map(|h| &h.0);
                Ok(UpgradeHandler::new(head, backend, on_upgrade, cancel).start(extra))
            }
        }
    }

    async fn await_head(
        &self,
        rx: oneshot::Receiver<Result<Upstream, ProxyError>>,
    ) -> Result<Upstream, ProxyError> {
        let received = match self.response_header_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| ProxyError::Timeout("timeout awaiting response headers".to_string()))?,
            None => rx.await,
        };
        received.map_err(|_| ProxyError::closed_early())?
    }
}
